//! # romburn
//!
//! Core library of an interactive ROM-programming appliance. It
//! receives ROM images from a host over a serial line using YMODEM
//! with CRC-16, and programs them into one of two memory families:
//!
//! - a serial NOR flash on a four-wire synchronous bus (W25Q32), or
//! - a parallel NOR flash bit-banged over GPIO with nanosecond
//!   sequencing (SST39 family).
//!
//! The crate contains no board code. Everything hardware-facing goes
//! through the small traits in [`hal`]; a board support layer
//! implements them for its UART, SPI peripheral and GPIO ports. With
//! the default `native` feature, [`hal::native`] provides a host
//! serial-port implementation of the transport so the protocol side
//! can be exercised against real senders.
//!
//! ## Anatomy of an upload
//!
//! ```text
//! console -> target::upload_*_rom -> YmodemReceiver -> FileSink
//!                                                        |
//!                                     erase policy + flash driver
//! ```
//!
//! The [`protocol::ymodem::YmodemReceiver`] blocks on the serial
//! line, validates each packet, and feeds file bytes to a
//! [`protocol::ymodem::FileSink`]. The sinks in [`target`] translate
//! that stream into erase-then-program operations: the serial-flash
//! variant picks erase granularities (64K/32K/4K) ahead of the write
//! cursor, the parallel variant erases each 4 KiB sector as the
//! cursor enters it. Neither needs the whole image in memory.
//!
//! ## Example
//!
//! ```ignore
//! use romburn::device::spi_nor::SpiNorFlash;
//! use romburn::target::upload_spi_rom;
//!
//! // spi, cs, delay, led and tick come from the board support layer.
//! let mut flash = SpiNorFlash::new(spi, cs, delay);
//! upload_spi_rom(&mut port, &mut flash, &mut led, &mut tick)?;
//! ```
//!
//! ## Concurrency model
//!
//! Single-threaded and cooperative: all protocol logic and flash I/O
//! run in the calling context. The only concurrency primitive is the
//! critical section the parallel bus provides around pin sequences
//! with bounded hold times. The YMODEM receive buffer lives inside
//! each [`protocol::ymodem::YmodemReceiver`]; a receiver is not
//! reentrant and drives one session at a time.

pub mod device;
pub mod error;
pub mod hal;
pub mod protocol;
pub mod target;

// Re-exports for convenience
pub use error::{Error, Result};
pub use protocol::ymodem::{FileSink, Status, YmodemConfig, YmodemReceiver};
pub use target::{upload_parallel_rom, upload_spi_rom};

#[cfg(feature = "native")]
pub use hal::native::NativeSerial;
