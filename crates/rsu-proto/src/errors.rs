//! Protocol error types.

use thiserror::Error;

/// Result alias for `rsu-proto` operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised while decoding or encoding a frame.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// STX or ETX delimiter did not match the expected octets.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// The decoded `type` field does not match any known opcode.
    #[error("unknown message type: {0:#06x}")]
    UnknownType(u16),

    /// The socket was closed or returned fewer bytes than the frame requires.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes the frame layout required.
        expected: usize,
        /// Bytes actually available before the stream ended.
        actual: usize,
    },

    /// Computed BCC disagreed with the BCC byte on the wire.
    #[error("bad checksum: computed {computed:#04x}, received {received:#04x}")]
    BadChecksum {
        /// BCC computed locally over the decoded bytes.
        computed: u8,
        /// BCC byte read from the wire.
        received: u8,
    },

    /// Underlying I/O failure while reading or writing a frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
