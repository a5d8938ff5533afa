//! Errors raised above the wire codec: sink delivery and session-level
//! failures.

use thiserror::Error;

/// An event could not be delivered to the external sink.
///
/// Logged by the caller and swallowed; it must never propagate back to
/// the wire.
#[derive(Debug, Error)]
#[error("event sink failed: {0}")]
pub struct SinkError(pub String);
