//! Typed constructors for every outbound request message.
//!
//! Each builder packs a fixed-layout, big-endian payload for its opcode.
//! Callers supply the sequence id drawn from [`crate::session::SequencePool`].

use rsu_proto::{opcode, Message};

/// Build a heartbeat request.
#[must_use]
pub fn heartbeat(seq: u8) -> Message {
    Message::new(seq, opcode::HEARTBEAT_REQUEST, Vec::new())
}

/// Build a get-TxPower request.
#[must_use]
pub fn get_tx_power(seq: u8) -> Message {
    Message::new(seq, opcode::GET_TXPOWER_REQUEST, Vec::new())
}

/// Build a set-TxPower request.
#[must_use]
pub fn set_tx_power(seq: u8, tx_power: u8) -> Message {
    Message::new(seq, opcode::SET_TXPOWER_REQUEST, vec![tx_power])
}

/// Build a get-RxSensitivity request.
#[must_use]
pub fn get_rx_sensitivity(seq: u8) -> Message {
    Message::new(seq, opcode::GET_RXSENS_REQUEST, Vec::new())
}

/// Build a set-RxSensitivity request.
#[must_use]
pub fn set_rx_sensitivity(seq: u8, rx_sensitivity: u8) -> Message {
    Message::new(seq, opcode::SET_RXSENS_REQUEST, vec![rx_sensitivity])
}

/// Build a get-channel request.
#[must_use]
pub fn get_channel(seq: u8) -> Message {
    Message::new(seq, opcode::GET_CHANNEL_REQUEST, Vec::new())
}

/// Build a get-station/roadway request.
#[must_use]
pub fn get_station_roadway(seq: u8) -> Message {
    Message::new(seq, opcode::GET_STATION_ROADWAY_REQUEST, Vec::new())
}

/// Build a set-station/roadway request.
///
/// Payload layout: `u16_be station || u8 roadway`.
#[must_use]
pub fn set_station_roadway(seq: u8, station: u16, roadway: u8) -> Message {
    let mut payload = Vec::with_capacity(3);
    payload.extend_from_slice(&station.to_be_bytes());
    payload.push(roadway);
    Message::new(seq, opcode::SET_STATION_ROADWAY_REQUEST, payload)
}

/// Build an open-antenna request.
#[must_use]
pub fn open_antenna(seq: u8) -> Message {
    Message::new(seq, opcode::OPEN_ANTENNA_REQUEST, Vec::new())
}

/// Build a close-antenna request.
#[must_use]
pub fn close_antenna(seq: u8) -> Message {
    Message::new(seq, opcode::CLOSE_ANTENNA_REQUEST, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_station_roadway_packs_big_endian() {
        let msg = set_station_roadway(3, 0x0102, 0x05);
        assert_eq!(msg.payload, vec![0x01, 0x02, 0x05]);
    }

    #[test]
    fn set_tx_power_packs_single_byte() {
        let msg = set_tx_power(0, 0xFE);
        assert_eq!(msg.payload, vec![0xFE]);
    }
}
