//! The application ↔ controller wire format (§6): a fixed 24-byte
//! little-endian record `{u64 event_id; u64 arg; double val;}` exchanged
//! over [`super::OsServices`]'s comm channel.

pub const APP_READY: u64 = 0x0001;
pub const APP_INTERVAL: u64 = 0x0010;
pub const APP_NEW_PHASE: u64 = 0x0100;
pub const APP_USER: u64 = 0x1000;

pub const WIRE_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommMessage {
    pub event_id: u64,
    pub arg: u64,
    pub val: f64,
}

impl CommMessage {
    pub fn new(event_id: u64, arg: u64, val: f64) -> Self {
        Self { event_id, arg, val }
    }

    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut buf = [0u8; WIRE_LEN];
        buf[0..8].copy_from_slice(&self.event_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.arg.to_le_bytes());
        buf[16..24].copy_from_slice(&self.val.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; WIRE_LEN]) -> Self {
        let event_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let arg = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let val = f64::from_le_bytes(buf[16..24].try_into().unwrap());
        Self { event_id, arg, val }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s5_app_ready_encoding() {
        let msg = CommMessage::new(APP_READY, 0, 0.0);
        let bytes = msg.encode();
        let mut expected = [0u8; WIRE_LEN];
        expected[0] = 0x01;
        assert_eq!(bytes, expected);
    }

    #[test]
    fn round_trips_new_phase_with_args() {
        let msg = CommMessage::new(APP_NEW_PHASE, 7, 0.0);
        let decoded = CommMessage::decode(&msg.encode());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_user_message_with_float_value() {
        let msg = CommMessage::new(APP_USER, 1, 3.5);
        let decoded = CommMessage::decode(&msg.encode());
        assert_eq!(decoded, msg);
    }
}
