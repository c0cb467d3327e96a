//! Notification dispatcher: bridges the interrupt path to blocking waiters.
//!
//! Captured frames go into a bounded queue. `wait_for` removes the first
//! queued entry with the requested code and leaves everything else queued,
//! so a notification nobody asked for yet stays available. When the queue is
//! full the oldest entry is dropped.
//!
//! Only the interrupt path calls `post`. Waiters only read and remove.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::events::{NullObserver, UciEvent, UciObserver};
use crate::protocol::constants::NOTIFICATION_FRAME_LEN;
use crate::protocol::{Notification, NotificationCode};
use crate::state::{SessionStateMachine, UwbsState};

/// Dispatcher and interrupt listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bytes read off the bus per interrupt.
    pub frame_len: usize,
    /// Maximum queued notifications.
    pub queue_capacity: usize,
    /// Interrupt line poll period (capped at 10 ms).
    pub poll_interval_ms: u64,
    /// Interrupt line asserted when low.
    pub irq_active_low: bool,
    /// Default wait for command notifications.
    pub notification_timeout_ms: u64,
    /// Wait for the Calibration-Apply notification.
    pub calibration_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            frame_len: NOTIFICATION_FRAME_LEN,
            queue_capacity: 16,
            poll_interval_ms: 2,
            irq_active_low: true,
            notification_timeout_ms: 2000,
            calibration_timeout_ms: 5000,
        }
    }
}

impl DispatchConfig {
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration_timeout_ms)
    }
}

pub struct Dispatcher {
    queue: Mutex<VecDeque<Notification>>,
    ready: Condvar,
    capacity: usize,
    state: SessionStateMachine,
    observer: Arc<dyn UciObserver>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self::with_observer(capacity, Arc::new(NullObserver))
    }

    pub fn with_observer(capacity: usize, observer: Arc<dyn UciObserver>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            state: SessionStateMachine::new(),
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current UWBS state as seen through delivered notifications.
    pub fn state(&self) -> UwbsState {
        self.state.current()
    }

    /// Deliver a captured frame.
    pub fn post(&self, frame: Vec<u8>) {
        let notification = Notification::new(frame);
        if notification.code().is_none() {
            debug!(notification = ?notification, "Unrecognized notification code");
        }

        let transition = self.state.observe(&notification);

        let dropped = {
            let mut queue = self.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(notification.clone());
            dropped
        };
        self.ready.notify_all();

        trace!(notification = ?notification, "Notification queued");
        if let Some(old) = dropped {
            warn!(dropped = ?old, "Notification queue full");
            self.observer.on_event(&UciEvent::NotificationDropped(old));
        }
        self.observer
            .on_event(&UciEvent::Notification(notification));
        if let Some(t) = transition {
            self.observer.on_event(&UciEvent::StateChanged {
                from: t.from,
                to: t.to,
            });
        }
    }

    /// Block until a notification with `code` is available or `timeout`
    /// elapses. The matching entry is removed; others stay queued.
    pub fn wait_for(&self, code: NotificationCode, timeout: Duration) -> Option<Notification> {
        let mut queue = self.lock();
        if let Some(pos) = queue.iter().position(|n| n.matches(code)) {
            return queue.remove(pos);
        }

        // A timeout too large for the clock means wait without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match self.ready.wait_timeout(queue, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self.ready.wait(queue).unwrap_or_else(PoisonError::into_inner),
            };

            if let Some(pos) = queue.iter().position(|n| n.matches(code)) {
                return queue.remove(pos);
            }
        }

        drop(queue);
        self.observer.on_event(&UciEvent::Timeout {
            code: code.as_byte(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
        None
    }

    /// Remove and return the oldest queued notification, if any.
    pub fn take_any(&self) -> Option<Notification> {
        self.lock().pop_front()
    }

    /// Number of queued notifications.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drop everything queued. Returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}
