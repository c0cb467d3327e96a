//! Mock SPI hardware for testing.
//!
//! `MockBus` is a scripted stand-in for the device: it logs writes, serves
//! queued reads, echoes full-duplex transfers, and can answer a command by
//! queueing a frame and raising the interrupt line the way the chip does.

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::spi::{self, SpiBus};

/// Error injected by the mock bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

impl spi::Error for MockError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

impl digital::Error for MockError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

#[derive(Default)]
struct Reply {
    prefix: Vec<u8>,
    bytes: Vec<u8>,
    raise_irq: bool,
}

#[derive(Default)]
struct MockBusState {
    /// Bytes served by reads, front first.
    read_queue: VecDeque<Vec<u8>>,
    /// Captured writes.
    write_log: Vec<Vec<u8>>,
    /// Captured full-duplex transfers (outgoing side).
    transfer_log: Vec<Vec<u8>>,
    /// Scripted replies keyed by command prefix.
    replies: Vec<Reply>,
    /// 1-based transfer indices whose echo gets corrupted.
    corrupt: HashSet<usize>,
    /// Remaining operations that fail.
    fail_next: usize,
}

/// Shared mock device state; clone handles freely.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockBusState>>,
    irq: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// SPI handle wired to this device.
    pub fn spi(&self) -> MockSpi {
        MockSpi { bus: self.clone() }
    }

    /// Interrupt line wired to this device (active-low).
    pub fn irq_pin(&self) -> MockIrq {
        MockIrq {
            asserted: self.irq.clone(),
        }
    }

    /// Queue bytes for the next read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.state.lock().unwrap().read_queue.push_back(bytes.to_vec());
    }

    /// Queue a notification frame and raise the interrupt line.
    pub fn push_notification(&self, frame: &[u8]) {
        self.queue_read(frame);
        self.irq.store(true, Ordering::SeqCst);
    }

    /// When a write starts with `prefix`, queue `frame` and raise the interrupt.
    pub fn notify_on(&self, prefix: &[u8], frame: &[u8]) {
        self.state.lock().unwrap().replies.push(Reply {
            prefix: prefix.to_vec(),
            bytes: frame.to_vec(),
            raise_irq: true,
        });
    }

    /// When a write starts with `prefix`, queue `bytes` for a synchronous read.
    pub fn respond_on(&self, prefix: &[u8], bytes: &[u8]) {
        self.state.lock().unwrap().replies.push(Reply {
            prefix: prefix.to_vec(),
            bytes: bytes.to_vec(),
            raise_irq: false,
        });
    }

    /// Corrupt the echo of the `index`-th transfer (1-based, counted over the
    /// lifetime of the mock).
    pub fn corrupt_transfer(&self, index: usize) {
        self.state.lock().unwrap().corrupt.insert(index);
    }

    /// Fail the next `count` SPI operations.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().write_log.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().write_log.clear();
    }

    pub fn get_transfers(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().transfer_log.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock().unwrap().transfer_log.len()
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    fn take_failure(state: &mut MockBusState) -> Result<(), MockError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(MockError);
        }
        Ok(())
    }
}

/// SPI side of the mock device.
pub struct MockSpi {
    bus: MockBus,
}

impl spi::ErrorType for MockSpi {
    type Error = MockError;
}

impl SpiBus<u8> for MockSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut state = self.bus.state.lock().unwrap();
        MockBus::take_failure(&mut state)?;

        words.fill(0);
        if let Some(frame) = state.read_queue.pop_front() {
            let n = frame.len().min(words.len());
            words[..n].copy_from_slice(&frame[..n]);
        }
        if state.read_queue.is_empty() {
            self.bus.irq.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.bus.state.lock().unwrap();
        MockBus::take_failure(&mut state)?;

        state.write_log.push(words.to_vec());

        let mut raise = false;
        let mut queued = Vec::new();
        for reply in state.replies.iter().filter(|r| words.starts_with(&r.prefix)) {
            queued.push(reply.bytes.clone());
            raise |= reply.raise_irq;
        }
        state.read_queue.extend(queued);
        if raise {
            self.bus.irq.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.bus.state.lock().unwrap();
        MockBus::take_failure(&mut state)?;

        state.transfer_log.push(write.to_vec());
        let index = state.transfer_log.len();

        read.fill(0);
        let n = read.len().min(write.len());
        read[..n].copy_from_slice(&write[..n]);
        if state.corrupt.contains(&index)
            && let Some(first) = read.first_mut()
        {
            *first ^= 0xFF;
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let out = words.to_vec();
        self.transfer(words, &out)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Output pin recording every level it is driven to.
#[derive(Clone, Default)]
pub struct MockPin {
    levels: Arc<Mutex<Vec<bool>>>,
    fail_low: Arc<AtomicBool>,
}

impl MockPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `set_low` fail, leaving the level unchanged, until cleared.
    pub fn fail_set_low(&self, fail: bool) {
        self.fail_low.store(fail, Ordering::SeqCst);
    }

    /// Every level driven so far, oldest first.
    pub fn levels(&self) -> Vec<bool> {
        self.levels.lock().unwrap().clone()
    }

    /// Current level; a pin never driven reads low.
    pub fn is_high(&self) -> bool {
        self.levels.lock().unwrap().last().copied().unwrap_or(false)
    }

    /// Number of high-to-low transitions.
    pub fn falling_edges(&self) -> usize {
        self.levels()
            .windows(2)
            .filter(|w| w[0] && !w[1])
            .count()
    }
}

impl digital::ErrorType for MockPin {
    type Error = MockError;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        if self.fail_low.load(Ordering::SeqCst) {
            return Err(MockError);
        }
        self.levels.lock().unwrap().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.lock().unwrap().push(true);
        Ok(())
    }
}

/// Active-low interrupt line driven by the mock device.
#[derive(Clone)]
pub struct MockIrq {
    asserted: Arc<AtomicBool>,
}

impl digital::ErrorType for MockIrq {
    type Error = Infallible;
}

impl InputPin for MockIrq {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.asserted.load(Ordering::SeqCst))
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.asserted.load(Ordering::SeqCst))
    }
}

/// Delay that only accounts for time instead of sleeping.
#[derive(Clone, Default)]
pub struct MockDelay {
    elapsed_ns: Arc<AtomicU64>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_ms(&self) -> u64 {
        self.elapsed_ns.load(Ordering::SeqCst) / 1_000_000
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.fetch_add(ns as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_raises_irq() {
        let bus = MockBus::new();
        let mut spi = bus.spi();
        let mut irq = bus.irq_pin();
        bus.notify_on(&[0x00, 0x00], &[0x01, 0x00]);

        assert!(irq.is_high().unwrap());
        spi.write(&[0x00, 0x00, 0x00, 0x00]).unwrap();
        assert!(irq.is_low().unwrap());

        let mut frame = [0u8; 4];
        spi.read(&mut frame).unwrap();
        assert_eq!(frame, [0x01, 0x00, 0x00, 0x00]);
        // Queue drained: line released.
        assert!(irq.is_high().unwrap());
    }

    #[test]
    fn test_mock_write_capture() {
        let bus = MockBus::new();
        let mut spi = bus.spi();
        spi.write(b"Hello").unwrap();
        spi.write(b"World").unwrap();

        let writes = bus.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_corrupt_and_fail() {
        let bus = MockBus::new();
        let mut spi = bus.spi();
        bus.corrupt_transfer(2);

        let mut rx = [0u8; 2];
        spi.transfer(&mut rx, &[0x11, 0x22]).unwrap();
        assert_eq!(rx, [0x11, 0x22]);
        spi.transfer(&mut rx, &[0x11, 0x22]).unwrap();
        assert_eq!(rx, [0xEE, 0x22]);

        bus.fail_next(1);
        assert_eq!(spi.write(&[0x00]), Err(MockError));
        assert!(spi.write(&[0x00]).is_ok());
    }
}
