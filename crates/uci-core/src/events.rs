//! Event system for decoupling applications from the driver.
//!
//! Packet and firmware events reach observers on the calling thread.
//! Notification, state and timeout events raised by the dispatcher are
//! handed to an [`ObserverThread`], so a slow observer never stalls the
//! interrupt listener.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::protocol::Notification;
use crate::state::UwbsState;

/// Events emitted by the driver.
#[derive(Debug, Clone)]
pub enum UciEvent {
    /// Packet sent or read synchronously.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Vec<u8>,
    },
    /// Notification captured from the interrupt line.
    Notification(Notification),
    /// UWBS state changed.
    StateChanged { from: UwbsState, to: UwbsState },
    /// Notification queue was full; the oldest entry was dropped.
    NotificationDropped(Notification),
    /// Waited for a notification that never came.
    Timeout { code: u8, timeout_ms: u64 },
    /// Firmware upload attempt started.
    FirmwareAttempt { attempt: u32, max_attempts: u32 },
    /// One firmware chunk verified.
    FirmwareProgress {
        attempt: u32,
        chunk: usize,
        bytes_sent: usize,
    },
    /// Echo mismatch; the device will be reset.
    FirmwareMismatch {
        attempt: u32,
        chunk: usize,
        offset: usize,
    },
    /// Firmware image fully transferred.
    FirmwareLoaded { attempts: u32, bytes: usize },
}

/// Packet direction on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving driver events.
pub trait UciObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UciEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UciObserver for NullObserver {
    fn on_event(&self, _event: &UciEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UciObserver for TracingObserver {
    fn on_event(&self, event: &UciEvent) {
        match event {
            UciEvent::Packet {
                direction,
                length,
                data,
            } => {
                tracing::trace!(dir = %direction, len = length, data = ?data, "SPI packet");
            }
            UciEvent::Notification(ntf) => {
                tracing::debug!(notification = ?ntf, "Notification received");
            }
            UciEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "UWBS state changed");
            }
            UciEvent::NotificationDropped(ntf) => {
                tracing::warn!(notification = ?ntf, "Notification queue full, dropped oldest");
            }
            UciEvent::Timeout { code, timeout_ms } => {
                tracing::warn!(
                    code = %format!("0x{:02X}", code),
                    timeout_ms,
                    "Notification timeout"
                );
            }
            UciEvent::FirmwareAttempt {
                attempt,
                max_attempts,
            } => {
                tracing::info!(attempt, max_attempts, "Firmware upload attempt");
            }
            UciEvent::FirmwareProgress {
                attempt,
                chunk,
                bytes_sent,
            } => {
                tracing::trace!(attempt, chunk, bytes_sent, "Firmware chunk verified");
            }
            UciEvent::FirmwareMismatch {
                attempt,
                chunk,
                offset,
            } => {
                tracing::warn!(attempt, chunk, offset, "Firmware echo mismatch");
            }
            UciEvent::FirmwareLoaded { attempts, bytes } => {
                tracing::info!(attempts, bytes, "Firmware loaded");
            }
        }
    }
}

/// Observer that records every event, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<UciEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UciEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl UciObserver for RecordingObserver {
    fn on_event(&self, event: &UciEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

enum Delivery {
    Event(UciEvent),
    Shutdown,
}

/// Observer that hands events to an [`ObserverThread`] and returns at once.
pub struct ForwardingObserver {
    tx: Sender<Delivery>,
}

impl UciObserver for ForwardingObserver {
    fn on_event(&self, event: &UciEvent) {
        // Fails only once the consumer is gone; the event is discarded.
        let _ = self.tx.send(Delivery::Event(event.clone()));
    }
}

/// Dedicated thread delivering forwarded events to an observer in order.
/// Stops and joins on drop after delivering what was already queued.
pub struct ObserverThread {
    tx: Sender<Delivery>,
    handle: Option<JoinHandle<()>>,
}

impl ObserverThread {
    /// Start the consumer. Events given to the returned observer are
    /// delivered to `observer` on the new thread.
    pub fn spawn(observer: Arc<dyn UciObserver>) -> io::Result<(Self, Arc<ForwardingObserver>)> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("uci-events".into())
            .spawn(move || {
                for delivery in rx {
                    match delivery {
                        Delivery::Event(event) => observer.on_event(&event),
                        Delivery::Shutdown => break,
                    }
                }
                debug!("Observer thread stopped");
            })?;

        let forwarder = Arc::new(ForwardingObserver { tx: tx.clone() });
        Ok((
            Self {
                tx,
                handle: Some(handle),
            },
            forwarder,
        ))
    }
}

impl Drop for ObserverThread {
    fn drop(&mut self) {
        let _ = self.tx.send(Delivery::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Observer thread panicked");
        }
    }
}
