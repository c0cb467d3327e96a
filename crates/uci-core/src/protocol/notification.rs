//! Notification frames and event codes.
//!
//! Notifications are device-initiated frames captured on the interrupt path.
//! The first byte is the event code; the rest is code-specific.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::*;

/// Known notification event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NotificationCode {
    DeviceStatus = DEVICE_STATUS_NTF,
    DeviceInfo = DEVICE_INFO_NTF,
    SessionStatus = SESSION_STATUS_NTF,
    ConfigStatus = CONFIG_STATUS_NTF,
    CalibrationApply = CALIBRATION_APPLY_NTF,
}

impl NotificationCode {
    pub const ALL: [NotificationCode; 5] = [
        NotificationCode::DeviceStatus,
        NotificationCode::DeviceInfo,
        NotificationCode::SessionStatus,
        NotificationCode::ConfigStatus,
        NotificationCode::CalibrationApply,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|code| *code as u8 == byte)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for NotificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationCode::DeviceStatus => write!(f, "DEVICE_STATUS"),
            NotificationCode::DeviceInfo => write!(f, "DEVICE_INFO"),
            NotificationCode::SessionStatus => write!(f, "SESSION_STATUS"),
            NotificationCode::ConfigStatus => write!(f, "CONFIG_STATUS"),
            NotificationCode::CalibrationApply => write!(f, "CALIBRATION_APPLY"),
        }
    }
}

/// Session state carried by a Session-Status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIndicator {
    Started,
    Stopped,
}

/// A captured notification frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Notification {
    bytes: Vec<u8>,
}

impl Notification {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// First byte of the frame, or `None` for an empty frame.
    pub fn raw_code(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Decoded event code, if it is one the driver knows.
    pub fn code(&self) -> Option<NotificationCode> {
        self.raw_code().and_then(NotificationCode::from_byte)
    }

    pub fn matches(&self, code: NotificationCode) -> bool {
        self.raw_code() == Some(code.as_byte())
    }

    /// Started/stopped indicator for Session-Status frames.
    pub fn session_indicator(&self) -> Option<SessionIndicator> {
        if !self.matches(NotificationCode::SessionStatus) {
            return None;
        }
        match self.bytes.get(1).copied() {
            Some(SESSION_STARTED) => Some(SessionIndicator::Started),
            Some(SESSION_STOPPED) => Some(SessionIndicator::Stopped),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex rendering of the frame, e.g. `10 01 00`.
    pub fn as_hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "Notification({} [{}])", code, self.as_hex()),
            None => write!(f, "Notification(? [{}])", self.as_hex()),
        }
    }
}

impl From<Vec<u8>> for Notification {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}
