//! Wire codec for the RSU device protocol.
//!
//! A frame is `STX(2) | seq(1) | type(2) | payload(N) | BCC(1) | ETX(1)`,
//! with `FE`/`FF` bytes inside the stuffed region escaped via a single
//! reserved escape byte (`0xFE`). See [`codec`] for the encode/decode
//! algorithms and [`opcode`] for the fixed payload length and frame class
//! per message type.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod errors;
pub mod message;
pub mod obu_event;
pub mod opcode;

pub use codec::{decode, encode, encode_to_vec, DecodeOptions};
pub use errors::{ProtoError, Result};
pub use message::{bcc, Message};
pub use obu_event::ObuEvent;
pub use opcode::FrameClass;
