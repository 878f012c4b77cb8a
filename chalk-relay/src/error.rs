//! Relay error taxonomy.
//!
//! Only startup-time failures (bind, handshake during construction) are
//! surfaced to callers. Failures on an established peer are converted into
//! lifecycle transitions by the connection itself.

use thiserror::Error;

/// Errors raised by the relay and the peer-side client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("{display_name} was not admitted by the moderator")]
    Rejected { display_name: String },

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RelayError>;
