//! gover: live-stream automation runtime.
//!
//! Hosts the durable integration task queue (webhook deliveries and bot
//! commands) and the danmaku ingest consumer that feeds it.

pub mod config;
pub mod consumer;
pub mod database;
pub mod error;
pub mod integration;
pub mod logging;
pub mod utils;

pub use error::{Error, Result};
