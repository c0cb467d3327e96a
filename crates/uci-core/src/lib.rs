//! UCI-Core: UWB Command Interface over SPI.
//!
//! Host-side driver for UWB chips that speak UCI on an SPI bus with a
//! separate interrupt line (NXP SR150 class devices).
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Bus**: SPI link with select framing, enable line, mock hardware
//! - **Protocol**: Opcodes, command encoding, notification codes
//! - **Dispatch**: Queue bridging the interrupt path to blocking waiters
//! - **Listener**: Background thread polling the interrupt line
//! - **State**: UWBS state machine driven by notifications
//! - **Firmware**: Chunked upload with echo verification and retry
//! - **Events**: Observer pattern for UI decoupling
//! - **Manager**: High-level device API
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "linux")]
//! # fn main() -> anyhow::Result<()> {
//! use uci_core::{DriverConfig, FileSource, UciDriver};
//!
//! let config = DriverConfig::default();
//! let parts = uci_core::bus::linux::open(&config.hardware)?;
//! let driver = UciDriver::new(parts, config)?;
//!
//! driver.load_firmware(&FileSource::new("sr150.bin"))?;
//! driver.initialize()?;
//! driver.start_ranging(0x1234_5678)?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "linux"))]
//! # fn main() {}
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod firmware;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod state;

// Re-exports for convenience
pub use bus::{BusError, BusLink, LinkTiming, MockBus, StdDelay};
pub use config::{DriverConfig, HardwareConfig};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use events::{NullObserver, ObserverThread, PacketDirection, TracingObserver, UciEvent, UciObserver};
pub use firmware::{FileSource, FirmwareConfig, FirmwareError, FirmwareSource, LoadReport, MemorySource};
pub use manager::{HardwareParts, UciDriver, UciError};
pub use protocol::{Command, Notification, NotificationCode};
pub use state::UwbsState;
