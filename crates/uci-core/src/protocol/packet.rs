//! Command packets and frame classification.
//!
//! The codec is stateless: a command is `[group, opcode] ++ payload` and
//! nothing else. Responses are length-bounded reads, so there is no length
//! field to parse on the way back in.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;
use super::notification::NotificationCode;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Config value for 0x{config_id:02X} is {len} bytes, limit is 255")]
    ValueTooLong { config_id: u8, len: usize },
}

/// Group + opcode pair, group in the high byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    pub fn group(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn opcode(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn header(self) -> [u8; HEADER_SIZE] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opcode({:02X}:{:02X})", self.group(), self.opcode())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// How a frame read off the bus should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Response,
    Notification(NotificationCode),
}

/// Classify a frame by its first byte.
pub fn classify(first_byte: u8) -> PacketKind {
    match NotificationCode::from_byte(first_byte) {
        Some(code) => PacketKind::Notification(code),
        None => PacketKind::Response,
    }
}

/// Encode a command packet.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&opcode.header());
    buf.extend_from_slice(payload);
    buf
}

/// Split a packet back into opcode and payload.
pub fn decode(bytes: &[u8]) -> Result<(Opcode, &[u8]), CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TooShort {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let opcode = Opcode(u16::from_be_bytes([bytes[0], bytes[1]]));
    Ok((opcode, &bytes[HEADER_SIZE..]))
}

/// Read a little-endian count response (session count, max sessions).
pub fn decode_count(bytes: &[u8]) -> Result<u16, CodecError> {
    if bytes.len() < COUNT_RESPONSE_LEN {
        return Err(CodecError::TooShort {
            expected: COUNT_RESPONSE_LEN,
            actual: bytes.len(),
        });
    }
    let mut cursor = Cursor::new(bytes);
    Ok(cursor.read_u16::<LittleEndian>().unwrap_or_default())
}

/// An immutable UCI command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl Command {
    pub fn new(opcode: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode: Opcode(opcode),
            payload: payload.into(),
        }
    }

    pub fn device_reset() -> Self {
        Self::new(DEVICE_RESET, RESERVED_PAYLOAD)
    }

    pub fn get_device_info() -> Self {
        Self::new(CORE_GET_DEVICE_INFO, RESERVED_PAYLOAD)
    }

    pub fn get_caps_info() -> Self {
        Self::new(CORE_GET_CAPS_INFO, RESERVED_PAYLOAD)
    }

    /// `[config_id, len(value)] ++ value`
    pub fn set_config(config_id: u8, value: &[u8]) -> Result<Self, CodecError> {
        let len = u8::try_from(value.len()).map_err(|_| CodecError::ValueTooLong {
            config_id,
            len: value.len(),
        })?;
        let mut payload = Vec::with_capacity(2 + value.len());
        payload.push(config_id);
        payload.push(len);
        payload.extend_from_slice(value);
        Ok(Self::new(CORE_SET_CONFIG, payload))
    }

    pub fn get_config(config_id: u8) -> Self {
        Self::new(CORE_GET_CONFIG, [config_id])
    }

    pub fn start_ranging(session_id: u32) -> Self {
        Self::new(CORE_START_RANGING, session_id_bytes(session_id))
    }

    pub fn stop_ranging(session_id: u32) -> Self {
        Self::new(CORE_STOP_RANGING, session_id_bytes(session_id))
    }

    pub fn get_session_count() -> Self {
        Self::new(CORE_GET_SESSION_COUNT, Vec::new())
    }

    pub fn get_max_sessions() -> Self {
        Self::new(CORE_GET_MAX_SESSIONS, Vec::new())
    }

    pub fn apply_calibration() -> Self {
        Self::new(CORE_APPLY_CALIBRATION, Vec::new())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.opcode, &self.payload)
    }
}

fn session_id_bytes(session_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<LittleEndian>(session_id)
        .expect("writing to a Vec cannot fail");
    buf
}
