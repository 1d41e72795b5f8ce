//! The ClustSafe energy-meter UDP wire protocol (§6).

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use crate::error::{errors, AutopinError};

const SIGNATURE: &[u8; 7] = b"ClSf601";
const PASSWORD_LEN: usize = 16;
const CMD_READ_AND_RESET_OUTLETS: u16 = 0x010F;

pub struct ClustSafeClient {
    socket: UdpSocket,
    password: [u8; PASSWORD_LEN],
    cache: Option<(Instant, Vec<u32>)>,
    cache_ttl: Duration,
}

impl ClustSafeClient {
    pub fn connect(addr: &str, password: &str) -> Result<Self, AutopinError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| errors::monitor("start", e.to_string()))?;
        socket
            .connect(addr)
            .map_err(|e| errors::monitor("start", e.to_string()))?;
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .map_err(|e| errors::monitor("start", e.to_string()))?;

        let mut pw = [0u8; PASSWORD_LEN];
        let bytes = password.as_bytes();
        let n = bytes.len().min(PASSWORD_LEN);
        pw[..n].copy_from_slice(&bytes[..n]);

        Ok(Self {
            socket,
            password: pw,
            cache: None,
            cache_ttl: Duration::from_millis(200),
        })
    }

    /// Reads and resets every outlet's energy counter, subject to the TTL
    /// cache so repeated `value()` calls within one tick don't hammer the
    /// device.
    pub fn read_and_reset_outlets(&mut self) -> Result<Vec<u32>, AutopinError> {
        if let Some((at, values)) = &self.cache {
            if at.elapsed() < self.cache_ttl {
                return Ok(values.clone());
            }
        }
        let values = self.request(CMD_READ_AND_RESET_OUTLETS, &[0x01])?;
        self.cache = Some((Instant::now(), values.clone()));
        Ok(values)
    }

    fn request(&self, command: u16, data: &[u8]) -> Result<Vec<u32>, AutopinError> {
        let packet = encode_request(&self.password, command, data);
        self.socket
            .send(&packet)
            .map_err(|e| errors::monitor("value", e.to_string()))?;

        let mut buf = [0u8; 512];
        let n = self
            .socket
            .recv(&mut buf)
            .map_err(|e| errors::monitor("value", e.to_string()))?;
        decode_response(&buf[..n])
    }
}

fn encode_request(password: &[u8; PASSWORD_LEN], command: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + 1 + PASSWORD_LEN + 2 + 2 + data.len() + 1);
    out.extend_from_slice(SIGNATURE);
    out.push(0);
    out.extend_from_slice(password);
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    let checksum = checksum_of(command, data.len() as u16, data);
    out.push(checksum);
    out
}

fn checksum_of(command: u16, len: u16, data: &[u8]) -> u8 {
    let mut sum: u32 = command.to_be_bytes().iter().map(|&b| b as u32).sum();
    sum += len.to_be_bytes().iter().map(|&b| b as u32).sum::<u32>();
    sum += data.iter().map(|&b| b as u32).sum::<u32>();
    (sum % 256) as u8
}

/// Decodes a response and returns its payload as big-endian u32 energy
/// counters, one per outlet.
fn decode_response(buf: &[u8]) -> Result<Vec<u32>, AutopinError> {
    const HEADER_LEN: usize = 7 + 1 + 1 + 15 + 2 + 2;
    if buf.len() < HEADER_LEN + 1 {
        return Err(errors::monitor("value", "response too short"));
    }
    if &buf[0..7] != SIGNATURE {
        return Err(errors::monitor("value", "bad signature"));
    }
    let status = buf[8];
    if status != 0 {
        return Err(errors::monitor("value", format!("device status {status}")));
    }
    let length = u16::from_be_bytes([buf[25], buf[26]]) as usize;
    let payload_start = HEADER_LEN;
    let payload_end = payload_start + length;
    if buf.len() < payload_end + 1 {
        return Err(errors::monitor("value", "truncated payload"));
    }
    let payload = &buf[payload_start..payload_end];
    Ok(payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_byte_sum_mod_256() {
        let data = [0x01];
        let checksum = checksum_of(CMD_READ_AND_RESET_OUTLETS, 1, &data);
        let expected = ((0x01u32 + 0x0Fu32) + 1 + 0x01) % 256;
        assert_eq!(checksum as u32, expected);
    }

    #[test]
    fn request_starts_with_signature_and_zero_byte() {
        let pw = [0u8; PASSWORD_LEN];
        let req = encode_request(&pw, CMD_READ_AND_RESET_OUTLETS, &[0x01]);
        assert_eq!(&req[0..7], SIGNATURE);
        assert_eq!(req[7], 0);
    }

    #[test]
    fn decode_response_parses_outlet_counters() {
        let mut resp = Vec::new();
        resp.extend_from_slice(SIGNATURE);
        resp.push(1); // device id
        resp.push(0); // status ok
        resp.extend_from_slice(&[0u8; 15]);
        resp.extend_from_slice(&CMD_READ_AND_RESET_OUTLETS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.extend_from_slice(&100u32.to_be_bytes());
        resp.extend_from_slice(&200u32.to_be_bytes());
        resp.push(0); // checksum, unchecked on decode

        let values = decode_response(&resp).unwrap();
        assert_eq!(values, vec![100, 200]);
    }

    #[test]
    fn nonzero_status_is_reported_as_a_monitor_error() {
        let mut resp = Vec::new();
        resp.extend_from_slice(SIGNATURE);
        resp.push(1);
        resp.push(2); // status: error
        resp.extend_from_slice(&[0u8; 15]);
        resp.extend_from_slice(&CMD_READ_AND_RESET_OUTLETS.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.push(0);

        assert!(decode_response(&resp).is_err());
    }
}
