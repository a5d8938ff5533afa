//! Frame delimiting, byte-stuffing and the BCC integrity check.
//!
//! A frame on the wire has the logical structure
//! `STX(2) | seq(1) | type(2) | payload(N) | BCC(1) | ETX(1)`, where `STX`
//! is `FF FF` and `ETX` is `FF`. Every logical byte in `seq|type|payload|BCC`
//! whose value is `>= 0xFE` is escaped as the two-octet sequence
//! `FE (byte - 0xFE)`; decoding reverses this one byte at a time.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ProtoError, Result};
use crate::message::{bcc, Message};
use crate::opcode::{classify, FrameClass};

const STX: u8 = 0xFF;
const ETX: u8 = 0xFF;
const ESCAPE: u8 = 0xFE;

/// Whether BCC mismatches are rejected on decode.
///
/// The original implementation never checked this; this codec verifies by
/// default and the caller threads the flag through from `ServerConfig`.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Reject frames whose computed BCC disagrees with the wire BCC byte.
    pub verify_bcc: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { verify_bcc: true }
    }
}

/// Read one logical (unstuffed) byte from the stream.
///
/// If the raw byte read is `0xFE`, one further raw byte is consumed and the
/// logical value is `0xFE + next`. This is applied one byte at a time so
/// that an escape byte occurring anywhere in the stuffed region (including
/// inside what would otherwise look like a counted escape window) is
/// always resolved correctly, unlike a scheme that first counts `FE`
/// occurrences and then reads that many extra bytes.
async fn read_logical_byte(reader: &mut (impl AsyncRead + Unpin)) -> Result<u8> {
    let raw = reader.read_u8().await?;
    if raw == ESCAPE {
        let next = reader.read_u8().await?;
        Ok(ESCAPE.wrapping_add(next))
    } else {
        Ok(raw)
    }
}

/// Write one logical byte to the stream, stuffing it if its value is
/// `>= 0xFE`.
fn stuff_byte(out: &mut BytesMut, logical: u8) {
    if logical >= ESCAPE {
        out.put_u8(ESCAPE);
        out.put_u8(logical - ESCAPE);
    } else {
        out.put_u8(logical);
    }
}

/// Decode one frame from `reader`.
///
/// Returns the frame's class (`Event` or `Response`) and the decoded
/// message. See module docs for the wire layout.
///
/// # Errors
///
/// `ProtoError::InvalidFrame` if STX or ETX do not match; `UnknownType` if
/// the opcode is not in the table; `BadChecksum` if `opts.verify_bcc` is set
/// and the computed BCC disagrees with the wire BCC byte; `Io`/`ShortRead`
/// on stream failure.
pub async fn decode(
    reader: &mut (impl AsyncRead + Unpin),
    opts: DecodeOptions,
) -> Result<(FrameClass, Message)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    if header[0] != STX || header[1] != STX {
        return Err(ProtoError::InvalidFrame("missing STX"));
    }

    let seq_raw = header[2];
    if seq_raw & 0x80 == 0 {
        return Err(ProtoError::InvalidFrame("sequence byte missing request bit"));
    }
    let seq = seq_raw & 0x07;
    let msg_type = u16::from_be_bytes([header[3], header[4]]);

    let (payload_len, class) = classify(msg_type)?;

    let mut payload = Vec::with_capacity(payload_len);
    for _ in 0..payload_len {
        payload.push(read_logical_byte(reader).await?);
    }

    let received_bcc = read_logical_byte(reader).await?;

    if opts.verify_bcc {
        let mut checked = Vec::with_capacity(5 + payload_len);
        checked.extend_from_slice(&header);
        checked.extend_from_slice(&payload);
        let computed = bcc(&checked);
        if computed != received_bcc {
            return Err(ProtoError::BadChecksum { computed, received: received_bcc });
        }
    }

    let etx = reader.read_u8().await?;
    if etx != ETX {
        return Err(ProtoError::InvalidFrame("missing ETX"));
    }

    Ok((class, Message::new(seq, msg_type, payload)))
}

/// Encode `msg` and write it to `writer`.
///
/// # Errors
///
/// `Io` on stream failure.
pub async fn encode(writer: &mut (impl AsyncWrite + Unpin), msg: &Message) -> Result<()> {
    let bytes = encode_to_vec(msg);
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Encode `msg` into a fresh byte vector, without touching any stream.
///
/// Exposed separately from [`encode`] so tests and the writer loop's
/// heartbeat/reply paths can inspect or batch encoded frames.
#[must_use]
pub fn encode_to_vec(msg: &Message) -> Vec<u8> {
    let mut logical = BytesMut::with_capacity(5 + msg.payload.len());
    logical.put_u8(STX);
    logical.put_u8(STX);
    logical.put_u8(0x80 | (msg.seq & 0x07));
    logical.put_u16(msg.msg_type);
    logical.put_slice(&msg.payload);

    let computed_bcc = bcc(&logical);

    let mut out = BytesMut::with_capacity(logical.len() + 4);
    out.put_slice(&logical[0..2]); // STX is never stuffed
    for &b in &logical[2..] {
        stuff_byte(&mut out, b);
    }
    stuff_byte(&mut out, computed_bcc);
    out.put_u8(ETX);
    out.to_vec()
}
