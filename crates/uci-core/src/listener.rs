//! Interrupt listener thread.
//!
//! Polls the interrupt line and, while it is asserted, reads one frame per
//! pass under the bus lock and posts it to the dispatcher. Nothing else
//! happens on this thread: waiting, command logic and observer callbacks
//! run elsewhere.
//!
//! The listener can be paused. Pausing waits for an in-flight read to
//! finish, and no frame is read until the pause is released.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use tracing::{debug, trace, warn};

use crate::bus::{BusError, BusLink, Line};
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::protocol::{PacketKind, classify};

/// Upper bound on the poll period.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to the running listener; stops and joins the thread on drop.
pub struct Listener {
    stop: Arc<AtomicBool>,
    paused: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Keeps the listener off the bus until dropped.
pub struct PauseGuard<'a> {
    paused: &'a Mutex<bool>,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        *lock_gate(self.paused) = false;
        debug!("Interrupt listener resumed");
    }
}

enum Poll {
    Frame(Vec<u8>),
    Nothing,
}

impl Listener {
    pub fn spawn<SPI, CS, CE, D, IRQ>(
        link: Arc<BusLink<SPI, CS, CE, D>>,
        mut irq: IRQ,
        dispatcher: Arc<Dispatcher>,
        config: &DispatchConfig,
    ) -> io::Result<Self>
    where
        SPI: SpiBus<u8> + Send + 'static,
        CS: OutputPin + Send + 'static,
        CE: OutputPin + Send + 'static,
        D: DelayNs + Send + 'static,
        IRQ: InputPin + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(Mutex::new(false));
        let poll = Duration::from_millis(config.poll_interval_ms).min(MAX_POLL_INTERVAL);
        let frame_len = config.frame_len;
        let active_low = config.irq_active_low;

        let stop_flag = stop.clone();
        let gate = paused.clone();
        let handle = thread::Builder::new()
            .name("uci-irq".into())
            .spawn(move || {
                debug!(poll_ms = poll.as_millis() as u64, frame_len, "Interrupt listener started");
                while !stop_flag.load(Ordering::Acquire) {
                    // The gate stays held for the whole pass so a pause
                    // cannot begin in the middle of a read.
                    let result = {
                        let paused = lock_gate(&gate);
                        if *paused {
                            Poll::Nothing
                        } else {
                            poll_once(&link, &mut irq, active_low, frame_len)
                        }
                    };
                    match result {
                        Poll::Frame(frame) => dispatcher.post(frame),
                        Poll::Nothing => thread::sleep(poll),
                    }
                }
                debug!("Interrupt listener stopped");
            })?;

        Ok(Self {
            stop,
            paused,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Keep the listener off the bus until the guard is dropped. Returns
    /// once any read already in progress has completed.
    pub fn pause(&self) -> PauseGuard<'_> {
        *lock_gate(&self.paused) = true;
        debug!("Interrupt listener paused");
        PauseGuard {
            paused: &self.paused,
        }
    }

    pub fn is_paused(&self) -> bool {
        *lock_gate(&self.paused)
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Interrupt listener panicked");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_gate(gate: &Mutex<bool>) -> MutexGuard<'_, bool> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

fn poll_once<SPI, CS, CE, D, IRQ>(
    link: &BusLink<SPI, CS, CE, D>,
    irq: &mut IRQ,
    active_low: bool,
    frame_len: usize,
) -> Poll
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CE: OutputPin,
    D: DelayNs,
    IRQ: InputPin,
{
    match irq_asserted(irq, active_low) {
        Ok(true) => {}
        Ok(false) => return Poll::Nothing,
        Err(e) => {
            warn!(error = %e, "Failed to sample interrupt line");
            return Poll::Nothing;
        }
    }

    let frame = match link.read(frame_len) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to read notification frame");
            return Poll::Nothing;
        }
    };
    if is_idle_frame(&frame) {
        trace!("Idle frame on asserted interrupt");
        return Poll::Nothing;
    }
    if let Some(PacketKind::Response) = frame.first().copied().map(classify) {
        debug!(code = frame[0], "Frame without a notification code on interrupt line");
    }
    Poll::Frame(frame)
}

fn irq_asserted<IRQ: InputPin>(irq: &mut IRQ, active_low: bool) -> Result<bool, BusError> {
    let level = if active_low { irq.is_low() } else { irq.is_high() };
    level.map_err(|e| BusError::from_pin(Line::Interrupt, e))
}

/// All-zero or all-one frames are what an idle MISO line reads as.
fn is_idle_frame(frame: &[u8]) -> bool {
    frame.iter().all(|&b| b == 0x00) || frame.iter().all(|&b| b == 0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LinkTiming, MockBus, MockDelay, MockPin};
    use crate::protocol::NotificationCode;
    use crate::protocol::constants::*;

    fn setup(bus: &MockBus) -> (Arc<Dispatcher>, Listener) {
        let link = Arc::new(
            BusLink::new(
                bus.spi(),
                MockPin::new(),
                MockPin::new(),
                MockDelay::new(),
                LinkTiming::default(),
            )
            .unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::new(8));
        let listener = Listener::spawn(
            link,
            bus.irq_pin(),
            dispatcher.clone(),
            &DispatchConfig::default(),
        )
        .unwrap();
        (dispatcher, listener)
    }

    #[test]
    fn test_captures_frame_on_interrupt() {
        let bus = MockBus::new();
        let (dispatcher, _listener) = setup(&bus);

        bus.push_notification(&[DEVICE_STATUS_NTF, 0x00, 0x11]);

        let ntf = dispatcher
            .wait_for(NotificationCode::DeviceStatus, Duration::from_secs(2))
            .unwrap();
        // Frames are read at the fixed frame length.
        assert_eq!(ntf.len(), NOTIFICATION_FRAME_LEN);
        assert_eq!(&ntf.as_bytes()[..3], &[DEVICE_STATUS_NTF, 0x00, 0x11]);
        assert!(!bus.irq_asserted());
    }

    #[test]
    fn test_drains_back_to_back_frames() {
        let bus = MockBus::new();
        let (dispatcher, _listener) = setup(&bus);

        bus.push_notification(&[CONFIG_STATUS_NTF, 0x00]);
        bus.push_notification(&[SESSION_STATUS_NTF, SESSION_STARTED]);

        assert!(
            dispatcher
                .wait_for(NotificationCode::SessionStatus, Duration::from_secs(2))
                .is_some()
        );
        assert!(
            dispatcher
                .wait_for(NotificationCode::ConfigStatus, Duration::from_secs(2))
                .is_some()
        );
    }

    #[test]
    fn test_stop_joins_thread() {
        let bus = MockBus::new();
        let (_dispatcher, mut listener) = setup(&bus);
        assert!(listener.is_running());
        listener.stop();
        assert!(!listener.is_running());
    }

    #[test]
    fn test_pause_holds_frames_until_resumed() {
        let bus = MockBus::new();
        let (dispatcher, listener) = setup(&bus);

        {
            let _paused = listener.pause();
            assert!(listener.is_paused());
            bus.push_notification(&[DEVICE_STATUS_NTF]);
            thread::sleep(Duration::from_millis(50));
            // Nothing read while paused.
            assert!(bus.irq_asserted());
            assert_eq!(dispatcher.pending(), 0);
        }

        assert!(!listener.is_paused());
        assert!(
            dispatcher
                .wait_for(NotificationCode::DeviceStatus, Duration::from_secs(2))
                .is_some()
        );
    }

    #[test]
    fn test_unknown_code_still_queued() {
        let bus = MockBus::new();
        let (dispatcher, _listener) = setup(&bus);

        bus.push_notification(&[0x55, 0x01]);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dispatcher.pending() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        let frame = dispatcher.take_any().unwrap();
        assert_eq!(&frame.as_bytes()[..2], &[0x55, 0x01]);
        assert_eq!(frame.code(), None);
    }

    #[test]
    fn test_idle_frame_detection() {
        assert!(is_idle_frame(&[0x00; 10]));
        assert!(is_idle_frame(&[0xFF; 10]));
        assert!(!is_idle_frame(&[0x01, 0x00]));
    }
}
