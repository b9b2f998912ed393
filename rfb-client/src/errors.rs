//! Error types for the RFB client.

use std::io;
use thiserror::Error;

/// Errors that can occur during client operation.
///
/// The cache layer itself never surfaces errors through this type: disk
/// failures, coordinator timeouts and hash mismatches are recovered
/// locally and the session continues with degraded caching. What does
/// surface here terminates the connection.
#[derive(Debug, Error)]
pub enum RfbClientError {
    /// Transport-level error (TCP, socket operations).
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Protocol error (unknown message type, malformed header, zero cache
    /// id on the wire).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A decode worker failed; re-raised on the main thread at flush.
    #[error("Decode error: {0}")]
    Decode(#[from] anyhow::Error),

    /// The server used an encoding the registry cannot decode.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(i32),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection has been closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RfbClientError {
    /// Whether reconnecting could plausibly succeed. Transport hiccups
    /// are retryable; protocol violations and configuration errors are
    /// not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionClosed)
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}
