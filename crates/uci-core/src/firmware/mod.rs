//! Firmware upload.
//!
//! The chip boots from a host-supplied image: the loader streams it in
//! 256-byte chunks over the bus link and checks the echo of every chunk.

pub mod loader;
pub mod source;

pub use loader::{FirmwareConfig, FirmwareLoader, LoadReport};
pub use source::{ChunkReader, FileSource, FirmwareSource, MemorySource};

use thiserror::Error;

use crate::bus::BusError;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Echo mismatch in chunk {chunk} at byte offset {offset}")]
    Mismatch { chunk: usize, offset: usize },

    #[error("Firmware source unreadable: {0}")]
    Source(#[source] std::io::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Firmware upload failed after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Box<FirmwareError>,
    },
}
