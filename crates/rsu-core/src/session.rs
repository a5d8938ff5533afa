//! Per-connection protocol state: the sequence-id pool, heartbeat policy,
//! and event dispatch.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use rsu_proto::opcode::{FrameClass, HEARTBEAT_RESPONSE, OBU_EVENT_REPORT};
use rsu_proto::{obu_event, Message};

use crate::builders;
use crate::error::SinkError;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 5;

/// A rotating pool of 8 sequence ids (values 0..7).
///
/// `next()` draws an id and immediately returns it to the pool: this is a
/// cheap rotating counter, not a reservation scheme. Concurrent callers
/// observe interleaved rotation rather than exclusive ownership of an id.
/// Uniqueness of in-flight ids is not required by this protocol, so a
/// single atomic counter is equivalent to, and simpler than, the source's
/// channel-of-8 draw-and-return.
#[derive(Debug, Default)]
pub struct SequencePool {
    next: AtomicU8,
}

impl SequencePool {
    /// Create a pool starting at id 0.
    #[must_use]
    pub fn new() -> Self {
        Self { next: AtomicU8::new(0) }
    }

    /// Draw the next id and return it to the pool in the same step.
    pub fn next(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed) & 0x07
    }
}

/// Receives decoded OBU event reports forwarded out of the wire protocol.
///
/// A single `publish` method taking the already-decoded event, serialized
/// for the downstream sink. Delivery failures are the caller's concern to
/// log and swallow; they must never propagate back to the wire.
pub trait EventSink: Send + Sync {
    /// Deliver one decoded event's JSON-encoded bytes to the sink.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` on delivery failure; the event handler logs and
    /// discards this rather than letting it affect the wire protocol.
    fn publish(&self, payload_bytes: &[u8]) -> Result<(), SinkError>;
}

/// What handling one decoded `Event`-class frame produced.
///
/// A frame may call for writing a reply back to the device, forwarding a
/// decoded record to the external sink, both, or neither. The two are
/// independent so the connection engine can write the reply without
/// waiting on the (possibly slow, possibly failing) sink call, and vice
/// versa.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// A reply frame the writer should serialize back to the device.
    pub reply: Option<Message>,
    /// JSON-encoded event bytes to forward to the external sink via
    /// [`crate`]'s [`EventSink`] abstraction, routed through the
    /// connection engine's `ConnectionSink` rather than held here.
    pub publish: Option<Vec<u8>>,
}

/// Per-connection protocol session: owns the sequence pool and the
/// operator-configurable heartbeat interval, and dispatches decoded
/// `Event`-class frames.
pub struct ProtocolSession {
    seq_pool: SequencePool,
    heartbeat_secs: AtomicU64,
}

impl Default for ProtocolSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolSession {
    /// Create a session with the default heartbeat interval.
    #[must_use]
    pub fn new() -> Self {
        Self { seq_pool: SequencePool::new(), heartbeat_secs: AtomicU64::new(DEFAULT_HEARTBEAT_SECS) }
    }

    /// Current heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.load(Ordering::Relaxed))
    }

    /// Set the heartbeat interval. Takes effect on the writer's next tick;
    /// `seconds` MUST be greater than zero.
    pub fn set_heartbeat_interval(&self, seconds: u64) {
        debug_assert!(seconds > 0, "heartbeat interval must be positive");
        self.heartbeat_secs.store(seconds.max(1), Ordering::Relaxed);
    }

    /// Draw the next sequence id.
    pub fn next_seq(&self) -> u8 {
        self.seq_pool.next()
    }

    /// Build a heartbeat request using the next sequence id.
    #[must_use]
    pub fn build_heartbeat(&self) -> Message {
        builders::heartbeat(self.next_seq())
    }

    /// Handle a decoded `Event`-class message.
    ///
    /// Heartbeat responses are a no-op. OBU event reports are decoded and
    /// returned as JSON-encoded bytes for the caller to forward to the
    /// external sink. Neither case produces a reply to write back;
    /// `EventOutcome::reply` stays available because the dispatch contract
    /// allows a future event type to reply.
    #[must_use]
    pub fn handle_event(&self, class: FrameClass, msg: &Message) -> EventOutcome {
        debug_assert_eq!(class, FrameClass::Event);

        match msg.msg_type {
            HEARTBEAT_RESPONSE => EventOutcome::default(),
            OBU_EVENT_REPORT => EventOutcome { reply: None, publish: Self::encode_obu_event(&msg.payload) },
            other => {
                tracing::warn!(msg_type = format_args!("{other:#06x}"), "unhandled event type");
                EventOutcome::default()
            }
        }
    }

    fn encode_obu_event(payload: &[u8]) -> Option<Vec<u8>> {
        let event = match obu_event::decode(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(%err, "failed to decode OBU event report");
                return None;
            }
        };

        match serde_json::to_vec(&ObuEventRecord::from(&event)) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(%err, "failed to serialize OBU event for sink");
                None
            }
        }
    }
}

/// JSON-serializable mirror of [`rsu_proto::ObuEvent`].
///
/// Kept separate from the wire-decoding type so `rsu-proto` stays free of a
/// `serde` dependency it otherwise has no use for.
#[derive(Debug, serde::Serialize)]
struct ObuEventRecord {
    timestamp_epoch_s: u32,
    station: u16,
    roadway: u8,
    vehicle_number: String,
    obu_mac: String,
    vehicle_type: u8,
    user_type: u8,
    battery: Option<u8>,
}

impl From<&rsu_proto::ObuEvent> for ObuEventRecord {
    fn from(e: &rsu_proto::ObuEvent) -> Self {
        Self {
            timestamp_epoch_s: e.timestamp_epoch_s,
            station: e.station,
            roadway: e.roadway,
            vehicle_number: e.vehicle_number.clone(),
            obu_mac: e.obu_mac.clone(),
            vehicle_type: e.vehicle_type,
            user_type: e.user_type,
            battery: e.battery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_pool_rotates_through_eight_values() {
        let pool = SequencePool::new();
        let seen: Vec<u8> = (0..16).map(|_| pool.next()).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn heartbeat_response_is_a_no_op() {
        let session = ProtocolSession::new();
        let msg = Message::new(0, HEARTBEAT_RESPONSE, vec![0x00]);
        let outcome = session.handle_event(FrameClass::Event, &msg);
        assert!(outcome.reply.is_none());
        assert!(outcome.publish.is_none());
    }

    #[test]
    fn unknown_event_type_produces_no_outcome() {
        let session = ProtocolSession::new();
        let msg = Message::new(0, 0xBEEF, Vec::new());
        let outcome = session.handle_event(FrameClass::Event, &msg);
        assert!(outcome.reply.is_none());
        assert!(outcome.publish.is_none());
    }

    #[test]
    fn set_heartbeat_interval_takes_effect_immediately() {
        let session = ProtocolSession::new();
        assert_eq!(session.heartbeat_interval(), Duration::from_secs(DEFAULT_HEARTBEAT_SECS));
        session.set_heartbeat_interval(30);
        assert_eq!(session.heartbeat_interval(), Duration::from_secs(30));
    }
}
