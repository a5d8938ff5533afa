//! Protocol session: sequence ids, typed message builders, heartbeat
//! policy, and event dispatch, layered on top of [`rsu_proto`]'s wire
//! codec.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod builders;
pub mod error;
pub mod session;

pub use error::SinkError;
pub use session::{EventOutcome, EventSink, ProtocolSession, SequencePool, DEFAULT_HEARTBEAT_SECS};
