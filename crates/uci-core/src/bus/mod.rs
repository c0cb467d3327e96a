//! Bus layer: SPI link framing and the hardware it runs on.
//!
//! The link is generic over the `embedded-hal` traits so it can run on any
//! HAL, on Linux through spidev/gpiod, or against the mock device in tests.

pub mod delay;
pub mod error;
pub mod link;
#[cfg(feature = "linux")]
pub mod linux;
pub mod mock;

pub use delay::StdDelay;
pub use error::{BusError, Line};
pub use link::{BusLink, LinkTiming};
pub use mock::{MockBus, MockDelay, MockIrq, MockPin, MockSpi};
