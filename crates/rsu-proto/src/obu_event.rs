//! Decoding of the OBU event report payload (opcode `C465`).
//!
//! Layout of the 65 logical payload bytes, in declared byte offsets:
//! `(1 mode)(12 plate GB2312)(1 vtype)(1 utype)(8 contract)(4 mac)`
//! `(3 status+battery)(4 ts_u32_be)(6 psam)(4 trsn)(2 station_u16_be)(1 roadway)`.

use crate::errors::{ProtoError, Result};

const PLATE_OFFSET: usize = 1;
const PLATE_LEN: usize = 12;
const VTYPE_OFFSET: usize = 13;
const UTYPE_OFFSET: usize = 14;
const MAC_OFFSET: usize = 23;
const MAC_LEN: usize = 4;
const STATUS_BATTERY_OFFSET: usize = 27;
const TIMESTAMP_OFFSET: usize = 30;
const STATION_OFFSET: usize = 44;
const ROADWAY_OFFSET: usize = 46;
const EXPECTED_LEN: usize = 65;

/// A decoded OBU event report, ready to forward to the external sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObuEvent {
    /// Device-reported timestamp, seconds since the Unix epoch.
    pub timestamp_epoch_s: u32,
    /// Station identifier.
    pub station: u16,
    /// Roadway identifier.
    pub roadway: u8,
    /// License plate, transcoded from GB2312 to UTF-8, NUL-trimmed.
    pub vehicle_number: String,
    /// OBU MAC address, rendered as lower-case colon-hex (`aa:bb:cc:dd`).
    pub obu_mac: String,
    /// Vehicle type code.
    pub vehicle_type: u8,
    /// User type code.
    pub user_type: u8,
    /// Battery level, when present in the status+battery field.
    pub battery: Option<u8>,
}

/// Decode an OBU event report from its 65-byte logical payload.
///
/// # Errors
///
/// `ProtoError::ShortRead` if `payload` is not exactly 65 bytes (the codec
/// already guarantees this for a well-formed frame; this check guards
/// callers that construct a payload by hand, e.g. in tests).
pub fn decode(payload: &[u8]) -> Result<ObuEvent> {
    if payload.len() != EXPECTED_LEN {
        return Err(ProtoError::ShortRead { expected: EXPECTED_LEN, actual: payload.len() });
    }

    let plate_bytes = &payload[PLATE_OFFSET..PLATE_OFFSET + PLATE_LEN];
    let (decoded, _, had_errors) = encoding_rs::GBK.decode(plate_bytes);
    let vehicle_number = if had_errors {
        decoded.trim_end_matches('\u{0}').replace('\u{FFFD}', "")
    } else {
        decoded.trim_end_matches('\u{0}').to_string()
    };

    let mac = &payload[MAC_OFFSET..MAC_OFFSET + MAC_LEN];
    let obu_mac = format!("{:02x}:{:02x}:{:02x}:{:02x}", mac[0], mac[1], mac[2], mac[3]);

    // `data[2]` carries the battery value per the later source revision
    // (see DESIGN.md for the confirmed decision).
    let battery = Some(payload[STATUS_BATTERY_OFFSET + 2]);

    let ts_bytes = &payload[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4];
    let timestamp_epoch_s = u32::from_be_bytes([ts_bytes[0], ts_bytes[1], ts_bytes[2], ts_bytes[3]]);

    let station = u16::from_be_bytes([payload[STATION_OFFSET], payload[STATION_OFFSET + 1]]);
    let roadway = payload[ROADWAY_OFFSET];

    Ok(ObuEvent {
        timestamp_epoch_s,
        station,
        roadway,
        vehicle_number,
        obu_mac,
        vehicle_type: payload[VTYPE_OFFSET],
        user_type: payload[UTYPE_OFFSET],
        battery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_payload() -> Vec<u8> {
        let mut buf = vec![0u8; EXPECTED_LEN];
        buf[0] = 0x01; // mode
        let (encoded, _, _) = encoding_rs::GBK.encode("\u{7ca4}A12345"); // 粤A12345
        buf[PLATE_OFFSET..PLATE_OFFSET + encoded.len()].copy_from_slice(&encoded);
        buf[VTYPE_OFFSET] = 2;
        buf[UTYPE_OFFSET] = 1;
        buf[MAC_OFFSET..MAC_OFFSET + MAC_LEN].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        buf[STATUS_BATTERY_OFFSET + 2] = 85;
        buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&1_700_000_000u32.to_be_bytes());
        buf[STATION_OFFSET..STATION_OFFSET + 2].copy_from_slice(&1u16.to_be_bytes());
        buf[ROADWAY_OFFSET] = 2;
        buf
    }

    #[test]
    fn decodes_obu_event_report() {
        let event = decode(&fixture_payload()).unwrap();
        assert_eq!(event.station, 1);
        assert_eq!(event.roadway, 2);
        assert_eq!(event.obu_mac, "11:22:33:44");
        assert_eq!(event.vehicle_number, "\u{7ca4}A12345");
        assert_eq!(event.battery, Some(85));
    }

    #[test]
    fn rejects_wrong_length_payload() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ProtoError::ShortRead { .. }));
    }
}
