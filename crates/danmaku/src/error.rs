//! Danmaku error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, DanmakuError>;

/// Errors that can occur while talking to a live message stream.
#[derive(Error, Debug)]
pub enum DanmakuError {
    /// Connection-related errors (handshake, socket closed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol violations (unexpected state, rejected auth, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed packet or payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Remote API returned a non-zero envelope code
    #[error("API error (code={code}): {message}")]
    Api { code: i64, message: String },

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the operation
    #[error("cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DanmakuError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
