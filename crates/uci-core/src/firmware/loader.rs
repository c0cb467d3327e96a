//! Firmware upload with echo verification.
//!
//! While the chip is in programming mode it clocks every received byte
//! back out, so each chunk goes through a full-duplex transfer and the
//! echo is compared with what was sent. Any failure (mismatch, bus error,
//! unreadable image) resets the chip and restarts from offset zero.

use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::FirmwareError;
use super::source::{ChunkReader, FirmwareSource};
use crate::bus::BusLink;
use crate::events::{NullObserver, UciEvent, UciObserver};
use crate::protocol::constants::{FIRMWARE_CHUNK_SIZE, FIRMWARE_MAX_ATTEMPTS};

/// Firmware upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Image loaded at startup, if any.
    pub image_path: Option<String>,
    /// Transfer block size.
    pub chunk_size: usize,
    /// Whole-image attempts before giving up.
    pub max_attempts: u32,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            chunk_size: FIRMWARE_CHUNK_SIZE,
            max_attempts: FIRMWARE_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Chunks sent by the successful attempt.
    pub chunks: usize,
    /// Bytes sent by the successful attempt.
    pub bytes: usize,
}

pub struct FirmwareLoader<'a, SPI, CS, CE, D> {
    link: &'a BusLink<SPI, CS, CE, D>,
    config: FirmwareConfig,
    observer: Arc<dyn UciObserver>,
}

impl<'a, SPI, CS, CE, D> FirmwareLoader<'a, SPI, CS, CE, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CE: OutputPin,
    D: DelayNs,
{
    pub fn new(link: &'a BusLink<SPI, CS, CE, D>, config: FirmwareConfig) -> Self {
        Self::with_observer(link, config, Arc::new(NullObserver))
    }

    pub fn with_observer(
        link: &'a BusLink<SPI, CS, CE, D>,
        config: FirmwareConfig,
        observer: Arc<dyn UciObserver>,
    ) -> Self {
        Self {
            link,
            config,
            observer,
        }
    }

    /// Upload `source`, retrying the whole image on failure.
    ///
    /// On error the device is left unprogrammed and must not be used.
    #[instrument(skip(self, source), fields(source = %source.describe()))]
    pub fn load(&self, source: &dyn FirmwareSource) -> Result<LoadReport, FirmwareError> {
        let max_attempts = self.config.max_attempts.max(1);

        self.link.assert_enable()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.observer.on_event(&UciEvent::FirmwareAttempt {
                attempt,
                max_attempts,
            });
            info!(attempt, max_attempts, "Starting firmware upload");

            match self.upload_once(source, attempt) {
                Ok((chunks, bytes)) => {
                    info!(attempt, chunks, bytes, "Firmware upload complete");
                    self.observer.on_event(&UciEvent::FirmwareLoaded {
                        attempts: attempt,
                        bytes,
                    });
                    return Ok(LoadReport {
                        attempts: attempt,
                        chunks,
                        bytes,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Firmware upload attempt failed, resetting device");
                    if attempt < max_attempts {
                        self.link.reset_device()?;
                        continue;
                    }
                    // The upload error is what the caller needs; a failed
                    // reset after it is only logged.
                    if let Err(reset_err) = self.link.reset_device() {
                        warn!(error = %reset_err, "Reset after final attempt failed");
                    }
                    error!(attempts = attempt, "Firmware upload failed");
                    return Err(FirmwareError::AttemptsExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            }
        }
    }

    /// One pass over the image. Returns (chunks, bytes) sent.
    fn upload_once(
        &self,
        source: &dyn FirmwareSource,
        attempt: u32,
    ) -> Result<(usize, usize), FirmwareError> {
        let reader = source.open().map_err(FirmwareError::Source)?;
        let mut chunks = ChunkReader::new(reader, self.config.chunk_size);

        loop {
            let index = chunks.index();
            let offset = chunks.offset();
            let Some(chunk) = chunks.next_chunk().map_err(FirmwareError::Source)? else {
                break;
            };

            let echoed = self.link.transact(&chunk, chunk.len())?;
            if echoed != chunk {
                let at = chunk
                    .iter()
                    .zip(&echoed)
                    .position(|(sent, got)| sent != got)
                    .unwrap_or(0);
                debug!(
                    chunk = index,
                    byte = at,
                    sent = chunk[at],
                    received = echoed.get(at).copied().unwrap_or_default(),
                    "Echo differs"
                );
                self.observer.on_event(&UciEvent::FirmwareMismatch {
                    attempt,
                    chunk: index,
                    offset,
                });
                return Err(FirmwareError::Mismatch {
                    chunk: index,
                    offset: offset + at,
                });
            }

            self.observer.on_event(&UciEvent::FirmwareProgress {
                attempt,
                chunk: index,
                bytes_sent: chunks.offset(),
            });
        }

        Ok((chunks.index(), chunks.offset()))
    }
}
