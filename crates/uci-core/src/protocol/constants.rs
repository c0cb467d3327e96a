//! Protocol constants for UCI over SPI.
//!
//! Opcodes are written as `(group << 8) | opcode`; the group byte goes on the
//! wire first.

// ============================================================================
// Core group commands (Host -> Device)
// ============================================================================

/// Software device reset. Answered by a Device-Status notification.
pub const DEVICE_RESET: u16 = 0x0000;

/// Device information query. Answered by a Device-Info notification.
pub const CORE_GET_DEVICE_INFO: u16 = 0x0001;

/// Capability query.
pub const CORE_GET_CAPS_INFO: u16 = 0x0002;

/// Configuration write: `[config_id, len] ++ value`.
pub const CORE_SET_CONFIG: u16 = 0x0003;

/// Configuration read: `[config_id]`.
pub const CORE_GET_CONFIG: u16 = 0x0004;

/// Start a ranging session: 4-byte little-endian session ID.
pub const CORE_START_RANGING: u16 = 0x0005;

/// Stop a ranging session: 4-byte little-endian session ID.
pub const CORE_STOP_RANGING: u16 = 0x0006;

/// Number of active sessions (2-byte LE response).
pub const CORE_GET_SESSION_COUNT: u16 = 0x0009;

/// Maximum supported sessions (2-byte LE response).
pub const CORE_GET_MAX_SESSIONS: u16 = 0x000A;

/// Apply stored calibration values. Answered by a Calibration-Apply notification.
pub const CORE_APPLY_CALIBRATION: u16 = 0x000C;

/// Two reserved bytes carried by the fixed-size core queries.
pub const RESERVED_PAYLOAD: [u8; 2] = [0x00, 0x00];

// ============================================================================
// Notification event codes (Device -> Host)
// ============================================================================

pub const DEVICE_STATUS_NTF: u8 = 0x01;
pub const DEVICE_INFO_NTF: u8 = 0x02;
pub const SESSION_STATUS_NTF: u8 = 0x10;
pub const CONFIG_STATUS_NTF: u8 = 0x20;
pub const CALIBRATION_APPLY_NTF: u8 = 0x40;

/// Session-Status indicator byte (offset 1): session started.
pub const SESSION_STARTED: u8 = 0x01;

/// Session-Status indicator byte (offset 1): session stopped.
pub const SESSION_STOPPED: u8 = 0x00;

// ============================================================================
// Framing
// ============================================================================

/// Command header: group byte + opcode byte.
pub const HEADER_SIZE: usize = 2;

/// Frame length read off the bus for each interrupt.
pub const NOTIFICATION_FRAME_LEN: usize = 10;

/// Length of the session count / max sessions responses.
pub const COUNT_RESPONSE_LEN: usize = 2;

/// Firmware transfer block size.
pub const FIRMWARE_CHUNK_SIZE: usize = 256;

/// Whole-image upload attempts before giving up.
pub const FIRMWARE_MAX_ATTEMPTS: u32 = 3;
