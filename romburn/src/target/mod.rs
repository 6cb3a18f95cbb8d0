//! Upload orchestration: binding YMODEM reception to a flash device.
//!
//! Each variant implements [`FileSink`](crate::protocol::ymodem::FileSink)
//! over one of the two flash drivers, translating the incoming byte
//! stream into erase-then-program operations without knowing block
//! boundaries in advance. The entry points here are what the console
//! invokes after telling the operator to start the transfer.

pub mod parallel;
pub mod spi;

pub use parallel::{ParallelRomUpload, upload_parallel_rom};
pub use spi::{SpiRomUpload, upload_spi_rom};

/// Grace period between announcing readiness and starting the
/// receiver, giving the operator time to pick a file on the host.
const SETUP_GRACE_SECS: u32 = 5;
