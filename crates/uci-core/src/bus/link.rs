//! SPI link with chip-select framing and the chip-enable line.
//!
//! Every transaction runs under one mutex: select low, transfer, flush,
//! settle, select high. The select guard releases the line on every exit
//! path, including transfer errors.

use std::sync::{Mutex, MutexGuard};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use super::error::{BusError, Line};

/// Minimum wait after asserting chip-enable.
pub const MIN_ENABLE_STABILIZE_MS: u32 = 10;

/// Link timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTiming {
    /// Hold time with select asserted after a command write.
    pub settle_us: u32,
    /// Wait after asserting chip-enable (clamped to at least 10 ms).
    pub enable_stabilize_ms: u32,
    /// Enable held low during a hardware reset.
    pub reset_low_ms: u32,
    /// Wait after releasing reset before the device is usable.
    pub reset_high_ms: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            settle_us: 10_000,
            enable_stabilize_ms: MIN_ENABLE_STABILIZE_MS,
            reset_low_ms: 100,
            reset_high_ms: 100,
        }
    }
}

struct LinkInner<SPI, CS, CE, D> {
    spi: SPI,
    cs: CS,
    ce: CE,
    delay: D,
}

/// Holds select low; drives it high again when dropped.
struct Selected<'a, CS: OutputPin> {
    cs: &'a mut CS,
}

impl<'a, CS: OutputPin> Selected<'a, CS> {
    fn assert(cs: &'a mut CS) -> Result<Self, BusError> {
        cs.set_low()
            .map_err(|e| BusError::from_pin(Line::Select, e))?;
        Ok(Self { cs })
    }
}

impl<CS: OutputPin> Drop for Selected<'_, CS> {
    fn drop(&mut self) {
        if let Err(e) = self.cs.set_high() {
            warn!(error = ?e, "Failed to release select line");
        }
    }
}

/// Exclusive owner of the SPI peripheral and the select/enable lines.
pub struct BusLink<SPI, CS, CE, D> {
    inner: Mutex<LinkInner<SPI, CS, CE, D>>,
    timing: LinkTiming,
}

impl<SPI, CS, CE, D> BusLink<SPI, CS, CE, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CE: OutputPin,
    D: DelayNs,
{
    /// Take ownership of the hardware. Select is driven high (idle).
    pub fn new(spi: SPI, mut cs: CS, ce: CE, delay: D, timing: LinkTiming) -> Result<Self, BusError> {
        cs.set_high()
            .map_err(|e| BusError::from_pin(Line::Select, e))?;
        Ok(Self {
            inner: Mutex::new(LinkInner { spi, cs, ce, delay }),
            timing,
        })
    }

    pub fn timing(&self) -> &LinkTiming {
        &self.timing
    }

    fn lock(&self) -> Result<MutexGuard<'_, LinkInner<SPI, CS, CE, D>>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }

    /// Write a command packet.
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn transmit(&self, bytes: &[u8]) -> Result<(), BusError> {
        let mut guard = self.lock()?;
        let LinkInner { spi, cs, delay, .. } = &mut *guard;

        let _selected = Selected::assert(cs)?;
        spi.write(bytes).map_err(BusError::from_spi)?;
        spi.flush().map_err(BusError::from_spi)?;
        delay.delay_us(self.timing.settle_us);

        trace!(data = ?bytes, "Transmit complete");
        Ok(())
    }

    /// Full-duplex transfer. Returns the `len_in` bytes clocked in while
    /// `bytes_out` was clocked out.
    #[instrument(level = "trace", skip(self, bytes_out), fields(len_out = bytes_out.len()))]
    pub fn transact(&self, bytes_out: &[u8], len_in: usize) -> Result<Vec<u8>, BusError> {
        let mut guard = self.lock()?;
        let LinkInner { spi, cs, .. } = &mut *guard;

        let mut bytes_in = vec![0u8; len_in];
        let _selected = Selected::assert(cs)?;
        spi.transfer(&mut bytes_in, bytes_out)
            .map_err(BusError::from_spi)?;
        spi.flush().map_err(BusError::from_spi)?;

        Ok(bytes_in)
    }

    /// Framed read of `len` bytes.
    #[instrument(level = "trace", skip(self))]
    pub fn read(&self, len: usize) -> Result<Vec<u8>, BusError> {
        let mut guard = self.lock()?;
        let LinkInner { spi, cs, .. } = &mut *guard;

        let mut buf = vec![0u8; len];
        let _selected = Selected::assert(cs)?;
        spi.read(&mut buf).map_err(BusError::from_spi)?;
        spi.flush().map_err(BusError::from_spi)?;

        trace!(data = ?buf, "Read complete");
        Ok(buf)
    }

    /// Power the chip and wait for it to stabilize.
    pub fn assert_enable(&self) -> Result<(), BusError> {
        let mut guard = self.lock()?;
        let LinkInner { ce, delay, .. } = &mut *guard;

        ce.set_high()
            .map_err(|e| BusError::from_pin(Line::Enable, e))?;
        delay.delay_ms(self.timing.enable_stabilize_ms.max(MIN_ENABLE_STABILIZE_MS));
        debug!("Chip enable asserted");
        Ok(())
    }

    pub fn deassert_enable(&self) -> Result<(), BusError> {
        let mut guard = self.lock()?;
        guard
            .ce
            .set_low()
            .map_err(|e| BusError::from_pin(Line::Enable, e))?;
        debug!("Chip enable deasserted");
        Ok(())
    }

    /// Hardware reset: enable low, wait, enable high, wait.
    #[instrument(level = "info", skip(self))]
    pub fn reset_device(&self) -> Result<(), BusError> {
        let mut guard = self.lock()?;
        let LinkInner { ce, delay, .. } = &mut *guard;

        ce.set_low()
            .map_err(|e| BusError::from_pin(Line::Enable, e))?;
        delay.delay_ms(self.timing.reset_low_ms);
        ce.set_high()
            .map_err(|e| BusError::from_pin(Line::Enable, e))?;
        delay.delay_ms(self.timing.reset_high_ms);

        info!("Device reset complete");
        Ok(())
    }

    /// Tear down the link and hand the hardware back.
    pub fn release(self) -> Result<(SPI, CS, CE, D), BusError> {
        let inner = self.inner.into_inner().map_err(|_| BusError::LockPoisoned)?;
        Ok((inner.spi, inner.cs, inner.ce, inner.delay))
    }
}
