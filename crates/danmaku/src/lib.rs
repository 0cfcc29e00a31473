//! Danmaku: client for the bilibili-compatible live message stream.
//!
//! The crate covers everything needed to pull chat records from a live room
//! in one bounded session:
//!
//! - [`packet`] - 16-byte framed packets, with nested zlib/brotli bodies
//! - [`wbi`] - WBI query signing and the `nav` key cache
//! - [`token`] - danmu-info token acquisition and gateway selection
//! - [`session`] - the [`SessionState`] machine and [`MessageStreamClient::poll`]
//! - [`message`] - [`ChatRecord`] extraction from `DANMU_MSG` bodies
//! - [`cookie`] - cookie helpers for the handshake

pub mod config;
pub mod cookie;
pub mod error;
pub mod http;
pub mod message;
pub mod packet;
pub mod session;
pub mod token;
pub mod wbi;

pub use config::MessageStreamConfig;
pub use error::{DanmakuError, Result};
pub use message::ChatRecord;
pub use packet::{Packet, decode_frame, encode_compressed};
pub use session::{ChatSink, MessageStreamClient, PollSummary, Session, SessionState};
pub use wbi::{WbiKeys, WbiSigner};
