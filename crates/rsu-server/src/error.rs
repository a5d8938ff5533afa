//! Server-level error types.

use thiserror::Error;

/// Errors that can occur in the gateway daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error (invalid bind address, etc). Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Protocol error decoding or encoding a frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] rsu_proto::ProtoError),

    /// `send_command` was called after `closing` was set.
    #[error("not connected")]
    NotConnected,
}
