//! Error types for romburn.

use thiserror::Error;

/// Result type for romburn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for romburn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial-line transport failure (framing, overrun, disconnect).
    #[error("serial line error: {0}")]
    Serial(String),

    /// An operation did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Synchronous serial bus failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// The bus is held by another transaction.
    #[error("bus busy")]
    Busy,

    /// Address does not meet the required alignment.
    #[error("misaligned address {address:#08x}: {alignment}-byte alignment required")]
    Misaligned {
        /// The offending address.
        address: u32,
        /// The alignment the operation requires.
        alignment: u32,
    },

    /// YMODEM framing or sequencing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote end cancelled the transfer.
    #[error("transfer cancelled")]
    Cancelled,

    /// The attached device did not identify as the expected part.
    #[error("unexpected device: manufacturer {manufacturer:#04x}, device {device:#06x}")]
    UnknownDevice {
        /// Manufacturer ID as read from the device.
        manufacturer: u8,
        /// Device ID as read from the device.
        device: u16,
    },

    /// Host serial port error.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),

    /// Host I/O error.
    #[cfg(feature = "native")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Collapse into the four-status transfer taxonomy.
    ///
    /// Bus and argument errors are never surfaced to the operator in
    /// finer grain than this; only timeout and cancellation keep their
    /// identity across the orchestrator boundary.
    #[must_use]
    pub fn status(&self) -> crate::protocol::ymodem::Status {
        use crate::protocol::ymodem::Status;

        match self {
            Self::Timeout(_) => Status::Timeout,
            Self::Cancelled => Status::Cancel,
            _ => Status::Error,
        }
    }
}
