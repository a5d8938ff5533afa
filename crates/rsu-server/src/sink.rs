//! Default [`EventSink`] implementation: structured logging.
//!
//! A production deployment supplies its own sink (a message queue, a
//! database writer); this one exists so the daemon is useful out of the
//! box and so tests have a zero-configuration default.

use rsu_core::{EventSink, SinkError};

/// Publishes every event as a `tracing` info event carrying the raw
/// JSON-encoded payload.
#[derive(Debug, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, payload_bytes: &[u8]) -> Result<(), SinkError> {
        match std::str::from_utf8(payload_bytes) {
            Ok(json) => tracing::info!(event = json, "obu event"),
            Err(_) => tracing::warn!(len = payload_bytes.len(), "obu event payload was not valid utf-8"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_never_fails() {
        let sink = LoggingEventSink;
        assert!(sink.publish(br#"{"station":1}"#).is_ok());
    }
}
