//! Error types for the WebTerm client.

use thiserror::Error;
use webterm_protocol::ProtocolError;

/// Errors surfaced by the client transport and controller.
///
/// Connection drops, ack timeouts, and rejected requests are reported as
/// [`ProtocolError`]s wrapped in [`ClientError::Protocol`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server URL could not be used.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The WebSocket could not be opened.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No connection is currently open.
    #[error("not connected")]
    NotConnected,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire-level failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local terminal I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The connection dropped under an outstanding request.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        ClientError::Protocol(ProtocolError::ConnectionClosed(reason.into()))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
