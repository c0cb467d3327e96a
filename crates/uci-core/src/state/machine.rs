//! UWBS lifecycle state mirrored from device notifications.
//!
//! The state only moves when the device says so: Device-Status puts it in
//! Idle, Session-Status started/stopped moves between Active and Idle.
//! Issuing a command never changes it.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::protocol::{Notification, NotificationCode, SessionIndicator};

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UwbsState {
    /// Before the first Device-Status notification.
    #[default]
    Inactive,
    /// Ready, no ranging session running.
    Idle,
    /// A ranging session is running.
    Active,
}

impl fmt::Display for UwbsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UwbsState::Inactive => write!(f, "INACTIVE"),
            UwbsState::Idle => write!(f, "IDLE"),
            UwbsState::Active => write!(f, "ACTIVE"),
        }
    }
}

impl UwbsState {
    /// State after observing `notification`.
    pub fn next(self, notification: &Notification) -> UwbsState {
        match notification.code() {
            Some(NotificationCode::DeviceStatus) => UwbsState::Idle,
            Some(NotificationCode::SessionStatus) => match notification.session_indicator() {
                Some(SessionIndicator::Started) => UwbsState::Active,
                Some(SessionIndicator::Stopped) => UwbsState::Idle,
                None => self,
            },
            _ => self,
        }
    }
}

/// A state change caused by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: UwbsState,
    pub to: UwbsState,
}

/// Thread-safe holder of the current state.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: Mutex<UwbsState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> UwbsState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a notification. Returns the transition if the state changed.
    pub fn observe(&self, notification: &Notification) -> Option<Transition> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        let to = from.next(notification);
        if from == to {
            return None;
        }
        *state = to;
        tracing::info!(from = %from, to = %to, "State transition");
        Some(Transition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    fn ntf(bytes: &[u8]) -> Notification {
        Notification::new(bytes.to_vec())
    }

    #[test]
    fn test_lifecycle() {
        let machine = SessionStateMachine::new();
        assert_eq!(machine.current(), UwbsState::Inactive);

        let t = machine.observe(&ntf(&[DEVICE_STATUS_NTF, 0x00])).unwrap();
        assert_eq!(
            t,
            Transition {
                from: UwbsState::Inactive,
                to: UwbsState::Idle
            }
        );

        machine
            .observe(&ntf(&[SESSION_STATUS_NTF, SESSION_STARTED]))
            .unwrap();
        assert_eq!(machine.current(), UwbsState::Active);

        machine
            .observe(&ntf(&[SESSION_STATUS_NTF, SESSION_STOPPED]))
            .unwrap();
        assert_eq!(machine.current(), UwbsState::Idle);

        // Repeating the same notification is not a transition.
        assert!(machine.observe(&ntf(&[DEVICE_STATUS_NTF])).is_none());
    }

    #[test]
    fn test_all_state_notification_pairs() {
        let device_status = ntf(&[DEVICE_STATUS_NTF, 0x00]);
        let started = ntf(&[SESSION_STATUS_NTF, SESSION_STARTED]);
        let stopped = ntf(&[SESSION_STATUS_NTF, SESSION_STOPPED]);
        let session_unknown = ntf(&[SESSION_STATUS_NTF, 0x05]);
        let session_short = ntf(&[SESSION_STATUS_NTF]);
        let others = [
            ntf(&[DEVICE_INFO_NTF, 0x01]),
            ntf(&[CONFIG_STATUS_NTF, 0x01]),
            ntf(&[CALIBRATION_APPLY_NTF, 0x01]),
            ntf(&[0x7E, 0x01]),
            ntf(&[]),
        ];

        for state in [UwbsState::Inactive, UwbsState::Idle, UwbsState::Active] {
            assert_eq!(state.next(&device_status), UwbsState::Idle);
            assert_eq!(state.next(&started), UwbsState::Active);
            assert_eq!(state.next(&stopped), UwbsState::Idle);
            assert_eq!(state.next(&session_unknown), state);
            assert_eq!(state.next(&session_short), state);
            for other in &others {
                assert_eq!(state.next(other), state, "{:?} on {}", other, state);
            }
        }
    }
}
