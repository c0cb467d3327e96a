//! Linux backend: spidev for the bus, gpiod character device for the lines.
//!
//! The kernel's own chip-select is disabled (`SPI_NO_CS`); select is a plain
//! GPIO output so the link controls its timing.

use std::io;

use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::spi::{self, SpiBus};
use gpiod::{Chip, Input, Lines, Options, Output};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use tracing::{info, instrument};

use super::delay::StdDelay;
use crate::config::HardwareConfig;
use crate::manager::HardwareParts;

/// I/O error from spidev or gpiod.
#[derive(Debug)]
pub struct LinuxError(pub io::Error);

impl From<io::Error> for LinuxError {
    fn from(err: io::Error) -> Self {
        LinuxError(err)
    }
}

impl spi::Error for LinuxError {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

impl digital::Error for LinuxError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

/// `/dev/spidevB.C` device in mode 0 with software chip-select.
pub struct SpidevBus {
    spi: Spidev,
}

impl SpidevBus {
    pub fn open(path: &str, clock_hz: u32) -> io::Result<Self> {
        let mut spi = Spidev::open(path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(clock_hz)
            .mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS)
            .lsb_first(false)
            .build();
        spi.configure(&options)?;
        Ok(Self { spi })
    }
}

impl spi::ErrorType for SpidevBus {
    type Error = LinuxError;
}

impl SpiBus<u8> for SpidevBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut transfer = SpidevTransfer::read(words);
        self.spi.transfer(&mut transfer)?;
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut transfer = SpidevTransfer::write(words);
        self.spi.transfer(&mut transfer)?;
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        // spidev wants equal-length buffers; pad the short side with zeros.
        let len = read.len().max(write.len());
        let mut tx = vec![0u8; len];
        tx[..write.len()].copy_from_slice(write);
        let mut rx = vec![0u8; len];
        {
            let mut transfer = SpidevTransfer::read_write(&tx, &mut rx);
            self.spi.transfer(&mut transfer)?;
        }
        let n = read.len();
        read.copy_from_slice(&rx[..n]);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let tx = words.to_vec();
        let mut transfer = SpidevTransfer::read_write(&tx, words);
        self.spi.transfer(&mut transfer)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Single gpiod output line.
pub struct GpioOutput {
    line: Lines<Output>,
}

impl GpioOutput {
    pub fn new(chip: &Chip, offset: u32, initial: bool, consumer: &str) -> io::Result<Self> {
        let opts = Options::output([offset])
            .values([initial])
            .consumer(consumer);
        Ok(Self {
            line: chip.request_lines(opts)?,
        })
    }
}

impl digital::ErrorType for GpioOutput {
    type Error = LinuxError;
}

impl OutputPin for GpioOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.line.set_values([false])?;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.line.set_values([true])?;
        Ok(())
    }
}

/// Single gpiod input line.
pub struct GpioInput {
    line: Lines<Input>,
}

impl GpioInput {
    pub fn new(chip: &Chip, offset: u32, consumer: &str) -> io::Result<Self> {
        let opts = Options::input([offset]).consumer(consumer);
        Ok(Self {
            line: chip.request_lines(opts)?,
        })
    }
}

impl digital::ErrorType for GpioInput {
    type Error = LinuxError;
}

impl InputPin for GpioInput {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        let [value] = self.line.get_values([false])?;
        Ok(value)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.is_high()?)
    }
}

pub type LinuxParts = HardwareParts<SpidevBus, GpioOutput, GpioOutput, GpioInput, StdDelay>;

/// Open the SPI device and request the three control lines.
///
/// Select starts high (idle) and enable starts high (chip powered).
#[instrument(level = "info")]
pub fn open(config: &HardwareConfig) -> io::Result<LinuxParts> {
    let spi = SpidevBus::open(&config.spi_device, config.spi_clock_hz)?;
    let chip = Chip::new(&config.gpio_chip)?;

    let cs = GpioOutput::new(&chip, config.select_pin, true, "uci-select")?;
    let ce = GpioOutput::new(&chip, config.enable_pin, true, "uci-enable")?;
    let irq = GpioInput::new(&chip, config.irq_pin, "uci-irq")?;

    info!(
        spi = %config.spi_device,
        clock_hz = config.spi_clock_hz,
        chip = %config.gpio_chip,
        "Hardware opened"
    );

    Ok(HardwareParts {
        spi,
        cs,
        ce,
        irq,
        delay: StdDelay,
    })
}
