//! Bus error type.
//!
//! HAL implementations each bring their own error types; the link flattens
//! them into `BusError` so the layers above stay non-generic.

use embedded_hal::digital;
use embedded_hal::spi;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("SPI transfer failed ({kind:?}): {message}")]
    Transfer { kind: spi::ErrorKind, message: String },

    #[error("Failed to drive {line} line: {message}")]
    Pin { line: Line, message: String },

    #[error("Bus lock poisoned by a panicking holder")]
    LockPoisoned,
}

/// Physical control lines owned by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Select,
    Enable,
    Interrupt,
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Line::Select => write!(f, "select"),
            Line::Enable => write!(f, "enable"),
            Line::Interrupt => write!(f, "interrupt"),
        }
    }
}

impl BusError {
    pub fn from_spi<E: spi::Error>(err: E) -> Self {
        BusError::Transfer {
            kind: err.kind(),
            message: format!("{:?}", err),
        }
    }

    pub fn from_pin<E: digital::Error>(line: Line, err: E) -> Self {
        BusError::Pin {
            line,
            message: format!("{:?} ({:?})", err, err.kind()),
        }
    }
}
