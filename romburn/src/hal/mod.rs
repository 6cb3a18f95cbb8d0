//! Hardware abstraction seams consumed by the core.
//!
//! The protocol engine and the flash drivers never touch hardware
//! directly; they are generic over the small traits defined here. A
//! board support layer implements these for its UART, SPI peripheral
//! and GPIO ports, and the optional [`native`] module implements the
//! serial-line side on a host machine for protocol testing.
//!
//! ```text
//! +--------------------+     +----------------------+
//! |   YMODEM receiver  |     |    flash drivers     |
//! +---------+----------+     +-----+----------+-----+
//!           |                      |          |
//!           v                      v          v
//!   +-------+------+       +------+---+  +---+------+
//!   |  SerialLine  |       |  SpiBus  |  |  RomBus  |
//!   +--------------+       +----------+  +----------+
//!      UART / host           SPI + CS     GPIO ports
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Blocking byte-oriented transport with a per-call timeout.
///
/// This is the serial line to the operator's host machine. Both
/// operations either complete fully within the timeout or fail;
/// partial transfers are reported as errors by the implementation.
pub trait SerialLine {
    /// Receive exactly `buf.len()` bytes, or fail with
    /// [`Error::Timeout`](crate::Error::Timeout) / a transport error.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// Send all of `data` within the timeout.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()>;
}

/// Synchronous full-duplex serial bus (the four-wire kind).
///
/// Chip select is not part of the bus; it is a separate [`OutputPin`]
/// owned by the driver, asserted around each transaction.
pub trait SpiBus {
    /// Shift `data` out while shifting the response in over it.
    fn transfer(&mut self, data: &mut [u8]) -> Result<()>;

    /// Shift `data` out, discarding whatever comes back.
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// A push-pull GPIO output. Writes cannot fail.
pub trait OutputPin {
    /// Drive the pin high.
    fn set_high(&mut self);

    /// Drive the pin low.
    fn set_low(&mut self);
}

/// Blocking delay measured in scheduler ticks.
pub trait Delay {
    /// Suspend for at least `ticks` scheduler ticks.
    fn delay_ticks(&mut self, ticks: u32);

    /// The scheduler tick frequency in Hz.
    fn tick_hz(&self) -> u32;
}

/// Logic level on a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Driven low.
    Low,
    /// Driven high.
    High,
}

/// Direction of the shared 8-bit data bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDirection {
    /// Input with pull-up: the memory drives the bus.
    Input,
    /// Push-pull output: the controller drives the bus.
    Output,
}

/// The parallel memory bus: 18 address lines fanned out over two GPIO
/// ports, an 8-bit bidirectional data bus, and three active-low
/// control lines.
///
/// The address lines are wired to scattered pins of two ports; the
/// driver computes the set/reset register words for both ports (the
/// bit permutation is the driver's hardware contract) and hands them
/// over verbatim. The data lines sit on the low byte of a third port.
pub trait RomBus {
    /// Latch an address by applying one set/reset word per port.
    fn write_address(&mut self, port_a: u32, port_b: u32);

    /// Drive a byte onto the data bus. Only meaningful in
    /// [`BusDirection::Output`].
    fn write_data(&mut self, value: u8);

    /// Sample the data bus. Only meaningful in [`BusDirection::Input`].
    fn read_data(&mut self) -> u8;

    /// Drive the chip-enable line.
    fn set_chip_enable(&mut self, level: Level);

    /// Drive the output-enable line.
    fn set_output_enable(&mut self, level: Level);

    /// Drive the write-enable line.
    fn set_write_enable(&mut self, level: Level);

    /// Reconfigure the eight data pins.
    fn set_data_direction(&mut self, direction: BusDirection);

    /// Busy-wait for at least `ns` nanoseconds.
    ///
    /// Implementations calibrate this against their own core clock (a
    /// cycle counter read, or a no-op loop scaled by cycles-per-ns).
    fn delay_ns(&mut self, ns: u32);

    /// Run `f` with preemption and interfering interrupts held off.
    ///
    /// Pin sequences with bounded inter-cycle gaps run inside this.
    /// Implementations must not require re-entrancy.
    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized;
}
