//! CDS register frame encoding and decoding
//!
//! Request: `[command, group, index]`.
//! Response: `[tag, p0, p1, p2, p3]`, payload least-significant byte first.

use std::fmt;

use crate::error::{ProtocolError, Result};

pub const REQUEST_LEN: usize = 3;
pub const FRAME_LEN: usize = 5;

pub const CMD_BEGIN_STREAM: u8 = b'S';
pub const CMD_END_STREAM: u8 = b'E';
pub const CMD_READ: u8 = b'R';

pub const TAG_ACK: u8 = 0x06;
pub const TAG_NAK: u8 = 0x15;

/// Register address: group and index byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterAddress {
    pub group: u8,
    pub index: u8,
}

impl RegisterAddress {
    pub const fn new(group: u8, index: u8) -> Self {
        Self { group, index }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}:0x{:02X}", self.group, self.index)
    }
}

/// Known CDS registers
pub mod registers {
    use super::RegisterAddress;

    pub const EV_MAX_CURRENT: RegisterAddress = RegisterAddress::new(0x01, 0x05);
    pub const EV_CHARGING_CURRENT: RegisterAddress = RegisterAddress::new(0x00, 0xE6);
    pub const EVSE_MAX_CURRENT: RegisterAddress = RegisterAddress::new(0x02, 0xE5);
    pub const EV_DUTY_CYCLE: RegisterAddress = RegisterAddress::new(0x07, 0xD4);
    pub const PP_MAX_CURRENT: RegisterAddress = RegisterAddress::new(0x09, 0x03);
    pub const REAL_POWER: RegisterAddress = RegisterAddress::new(0x08, 0x43);
    pub const VOLTAGE_L1: RegisterAddress = RegisterAddress::new(0x08, 0x66);
    pub const CURRENT_L1: RegisterAddress = RegisterAddress::new(0x08, 0x6C);
    pub const CP_STATE: RegisterAddress = RegisterAddress::new(0x00, 0x14);
}

/// Encode a request frame
pub fn encode_request(command: u8, address: RegisterAddress) -> [u8; REQUEST_LEN] {
    [command, address.group, address.index]
}

/// Read-register request
pub fn read_request(address: RegisterAddress) -> [u8; REQUEST_LEN] {
    encode_request(CMD_READ, address)
}

/// Decode the payload of a 5-byte frame as `f32`. Pure; the tag is ignored.
pub fn decode_float(frame: &[u8; FRAME_LEN]) -> f32 {
    f32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]])
}

/// Raw 5-byte register response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFrame([u8; FRAME_LEN]);

impl RegisterFrame {
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a frame from a slice that must be exactly [`FRAME_LEN`] long
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let frame: [u8; FRAME_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::decode(format!(
                "frame length {} (expected {})",
                bytes.len(),
                FRAME_LEN
            ))
        })?;
        Ok(Self(frame))
    }

    pub fn ack(payload: [u8; 4]) -> Self {
        Self([TAG_ACK, payload[0], payload[1], payload[2], payload[3]])
    }

    /// ACK frame carrying `value` in the wire byte order
    pub fn ack_f32(value: f32) -> Self {
        Self::ack(value.to_le_bytes())
    }

    pub fn nak() -> Self {
        Self([TAG_NAK, 0, 0, 0, 0])
    }

    pub fn tag(&self) -> u8 {
        self.0[0]
    }

    pub fn payload(&self) -> [u8; 4] {
        [self.0[1], self.0[2], self.0[3], self.0[4]]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Accept only ACK frames
    pub fn validate(&self) -> Result<()> {
        match self.tag() {
            TAG_ACK => Ok(()),
            TAG_NAK => Err(ProtocolError::decode("register rejected (NAK)")),
            other => Err(ProtocolError::decode(format!(
                "unexpected frame tag 0x{:02X}",
                other
            ))),
        }
    }

    pub fn decode_f32(&self) -> f32 {
        decode_float(&self.0)
    }

    pub fn decode_cp_state(&self) -> CpState {
        CpState::from_byte(self.0[1])
    }
}

/// IEC 61851 control pilot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpState {
    A1,
    B1,
    B2,
    C1,
    C2,
    F,
    Unknown,
}

impl CpState {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => CpState::A1,
            0x02 => CpState::B1,
            0x03 => CpState::B2,
            0x04 => CpState::C1,
            0x05 => CpState::C2,
            0x06 => CpState::F,
            _ => CpState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CpState::A1 => "A1",
            CpState::B1 => "B1",
            CpState::B2 => "B2",
            CpState::C1 => "C1",
            CpState::C2 => "C2",
            CpState::F => "F",
            CpState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
