//! Parallel NOR flash driver (SST39 family), bit-banged over GPIO.
//!
//! The memory hangs directly off two GPIO ports: 18 address lines
//! scattered across both, an 8-bit bidirectional data bus on the low
//! byte of a third port, and active-low chip-enable, output-enable
//! and write-enable lines. There is no controller in between; every
//! memory cycle is sequenced in software against the device's
//! nanosecond hold times.
//!
//! Commands are delivered through the canonical three-cycle unlock
//! (0xAA → 0x5555, 0x55 → 0x2AAA, command → 0x5555). Erase and
//! program completion is detected by bit-7 polarity: reads of the
//! last-written cell return the complement of the target bit 7 until
//! the internal operation finishes.

use log::debug;

use crate::error::{Error, Result};
use crate::hal::{BusDirection, Delay, Level, RomBus};

/// Sector size in bytes; the erase granularity of the device.
pub const SECTOR_SIZE: usize = 4096;

/// Mask selecting the sector base within the 18-bit address space.
pub const SECTOR_BASE_MASK: u32 = 0x3F000;

/// First unlock address, also the command latch address.
const UNLOCK_ADDR1: u32 = 0x5555;
/// Second unlock address.
const UNLOCK_ADDR2: u32 = 0x2AAA;

/// Program one byte.
const CMD_PROGRAM: u8 = 0xA0;
/// Erase prelude; a second unlock and a confirm value follow.
const CMD_ERASE: u8 = 0x80;
/// Enter software-ID mode.
const CMD_ENTER_ID: u8 = 0x90;
/// Exit software-ID mode.
const CMD_EXIT_ID: u8 = 0xF0;
/// Erase confirm value for one sector.
const ERASE_SECTOR_CONFIRM: u8 = 0x30;
/// Erase confirm value for the whole chip.
const ERASE_CHIP_CONFIRM: u8 = 0x10;

// Poll budgets, in read cycles of at least 40 ns each. Sector erase
// tops out at 25 ms on this family, chip erase at 100 ms, and a byte
// program at 20 us.
const SECTOR_ERASE_POLLS: u32 = 625_000;
const CHIP_ERASE_POLLS: u32 = 2_500_000;
const PROGRAM_POLLS: u32 = 2_000;

// Device timing floors in nanoseconds.
const WRITE_PULSE_NS: u32 = 40;
const WRITE_RECOVERY_NS: u32 = 30;
const READ_ACCESS_NS: u32 = 60;
const COMMAND_LATCH_NS: u32 = 150;
const BYTE_LOAD_NS: u32 = 100;
const BYTE_RECOVERY_NS: u32 = 50;

/// Port A pins carrying address lines: A9→PA7, A10→PA10, A11→PA9,
/// A17→PA1.
const PORT_A_PINS: u32 = 0b0000_0110_1000_0010;

/// Port B pins carrying address lines: A0..A2→PB0..PB2, A3..A7→
/// PB4..PB8, A8→PB13, A12→PB9, A13→PB14, A14→PB15, A15→PB10,
/// A16→PB12.
const PORT_B_PINS: u32 = 0b1111_0111_1111_0111;

/// Set/reset word for port A's share of an address.
///
/// The low half sets pins for 1-bits, the high half resets the rest
/// of this port's address pins. The permutation is the board wiring
/// and must not be rearranged.
fn port_a_word(address: u32) -> u32 {
    let set = ((address & (1 << 9)) >> 2)
        | (address & (1 << 10))
        | ((address & (1 << 11)) >> 2)
        | ((address & (1 << 17)) >> 16);
    set | ((!set & PORT_A_PINS) << 16)
}

/// Set/reset word for port B's share of an address.
fn port_b_word(address: u32) -> u32 {
    let set = (address & 0b111)
        | ((address & 0b110_0000_1111_1000) << 1)
        | ((address & (1 << 8)) << 5)
        | ((address & (1 << 12)) >> 3)
        | ((address & (1 << 15)) >> 5)
        | ((address & (1 << 16)) >> 4);
    set | ((!set & PORT_B_PINS) << 16)
}

/// One write cycle: address, data, CE low, WE low, hold, release,
/// recover.
fn write_cycle<B: RomBus>(bus: &mut B, address: u32, data: u8) {
    bus.write_address(port_a_word(address), port_b_word(address));
    bus.write_data(data);

    bus.set_chip_enable(Level::Low);
    bus.set_write_enable(Level::Low);
    bus.delay_ns(WRITE_PULSE_NS);
    bus.set_write_enable(Level::High);
    bus.set_chip_enable(Level::High);
    bus.delay_ns(WRITE_RECOVERY_NS);
}

/// One read cycle: address, CE low, OE low, access time, sample,
/// release.
fn read_cycle<B: RomBus>(bus: &mut B, address: u32) -> u8 {
    bus.write_address(port_a_word(address), port_b_word(address));

    bus.set_chip_enable(Level::Low);
    bus.set_output_enable(Level::Low);
    bus.delay_ns(READ_ACCESS_NS);
    let data = bus.read_data();
    bus.set_output_enable(Level::High);
    bus.set_chip_enable(Level::High);

    data
}

/// The three-cycle command unlock.
fn unlock<B: RomBus>(bus: &mut B, command: u8) {
    write_cycle(bus, UNLOCK_ADDR1, 0xAA);
    write_cycle(bus, UNLOCK_ADDR2, 0x55);
    write_cycle(bus, UNLOCK_ADDR1, command);
}

/// Erase granularities offered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseKind {
    /// One 4 KiB sector; the address is aligned down to its base.
    Sector,
    /// The whole chip; the address is ignored.
    Chip,
}

/// Driver for a parallel NOR flash wired straight to GPIO.
///
/// The driver owns the data-bus direction: every public operation
/// returns with the data pins back in input mode, and any switch to
/// output happens only with all three control lines deasserted.
pub struct ParallelNorFlash<B, D> {
    bus: B,
    delay: D,
}

impl<B, D> ParallelNorFlash<B, D>
where
    B: RomBus,
    D: Delay,
{
    /// Take ownership of the bus and delay source.
    pub fn new(bus: B, delay: D) -> Self {
        Self { bus, delay }
    }

    /// Tear the driver down, handing the bus and delay source back.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }

    /// Read the software ID: (manufacturer, device).
    pub fn read_id(&mut self) -> Result<(u8, u8)> {
        self.idle_bus();

        self.bus.set_data_direction(BusDirection::Output);
        self.bus.critical(|bus| unlock(bus, CMD_ENTER_ID));
        self.bus.delay_ns(COMMAND_LATCH_NS);
        self.bus.set_data_direction(BusDirection::Input);

        let manufacturer = self.bus.critical(|bus| read_cycle(bus, 0));
        let device = self.bus.critical(|bus| read_cycle(bus, 1));

        self.bus.delay_ns(COMMAND_LATCH_NS);
        self.bus.set_data_direction(BusDirection::Output);
        self.bus.critical(|bus| unlock(bus, CMD_EXIT_ID));
        self.bus.delay_ns(COMMAND_LATCH_NS);
        self.bus.set_data_direction(BusDirection::Input);

        Ok((manufacturer, device))
    }

    /// Erase a sector or the whole chip.
    ///
    /// Blocks while polling for completion; the poll budget is sized
    /// to the device's worst-case erase time with margin.
    pub fn erase(&mut self, address: u32, kind: EraseKind) -> Result<()> {
        let (target, confirm, polls) = match kind {
            EraseKind::Sector => (
                address & SECTOR_BASE_MASK,
                ERASE_SECTOR_CONFIRM,
                SECTOR_ERASE_POLLS,
            ),
            EraseKind::Chip => (UNLOCK_ADDR1, ERASE_CHIP_CONFIRM, CHIP_ERASE_POLLS),
        };
        debug!("erase {kind:?} at {target:#07x}");

        self.idle_bus();

        self.bus.set_data_direction(BusDirection::Output);
        self.bus.critical(|bus| {
            unlock(bus, CMD_ERASE);
            write_cycle(bus, UNLOCK_ADDR1, 0xAA);
            write_cycle(bus, UNLOCK_ADDR2, 0x55);
            write_cycle(bus, target, confirm);
        });
        self.bus.set_data_direction(BusDirection::Input);

        // Erased cells read 0xFF, so bit 7 comes up once the internal
        // operation finishes.
        for _ in 0..polls {
            if read_cycle(&mut self.bus, target) & 0x80 == 0x80 {
                break;
            }
        }

        // One further read distinguishes completion on the last poll
        // from loop exhaustion.
        if read_cycle(&mut self.bus, target) & 0x80 == 0 {
            return Err(Error::Timeout("erase did not complete".into()));
        }

        Ok(())
    }

    /// Program `data` starting at `address`, one byte per memory
    /// cycle. Sectors are not erased here.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.idle_bus();

        for (offset, &byte) in data.iter().enumerate() {
            let cell = address + offset as u32;

            self.bus.set_data_direction(BusDirection::Output);
            self.bus.critical(|bus| {
                unlock(bus, CMD_PROGRAM);
                write_cycle(bus, cell, byte);
                bus.delay_ns(BYTE_LOAD_NS);
            });
            self.bus.set_data_direction(BusDirection::Input);

            self.poll_programmed(cell, byte)?;
            self.bus.delay_ns(BYTE_RECOVERY_NS);
        }

        Ok(())
    }

    /// Read `out.len()` bytes starting at `base` (normally a sector).
    pub fn read_sector(&mut self, base: u32, out: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.idle_bus();

        for (offset, slot) in out.iter_mut().enumerate() {
            *slot = self
                .bus
                .critical(|bus| read_cycle(bus, base + offset as u32));
        }

        Ok(())
    }

    /// Bit 7 of the programming cell reads inverted until the write
    /// completes.
    fn poll_programmed(&mut self, cell: u32, value: u8) -> Result<()> {
        for _ in 0..PROGRAM_POLLS {
            if read_cycle(&mut self.bus, cell) & 0x80 == value & 0x80 {
                break;
            }
        }

        if read_cycle(&mut self.bus, cell) & 0x80 != value & 0x80 {
            return Err(Error::Timeout("byte program did not complete".into()));
        }

        Ok(())
    }

    /// Deassert every control line and let the bus settle for a tick.
    /// Direction changes are only legal from this state.
    fn idle_bus(&mut self) {
        self.bus.set_chip_enable(Level::High);
        self.bus.set_output_enable(Level::High);
        self.bus.set_write_enable(Level::High);
        self.delay.delay_ticks(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMORY_SIZE: usize = 1 << 18;
    const SST_MANUFACTURER: u8 = 0xBF;
    const SST_DEVICE: u8 = 0xD6;

    /// Behavioural model of the SST39 on its bus.
    ///
    /// Decodes the address fan-out back through the documented pin
    /// map, runs the unlock/command state machine off write-enable
    /// edges, emulates bit-7 polarity while "busy", and panics on any
    /// violation of the bus discipline (driving data pins while in
    /// input mode, flipping direction with a control line asserted,
    /// issuing write cycles outside a critical section).
    struct MockRomBus {
        memory: Vec<u8>,
        a_pins: u32,
        b_pins: u32,
        data_latch: u8,
        direction: BusDirection,
        ce: Level,
        oe: Level,
        we: Level,
        in_critical: bool,
        id_mode: bool,
        state: CommandState,
        busy_reads: u32,
        stuck_busy: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum CommandState {
        Idle,
        Unlock1,
        Unlock2,
        ProgramPending,
        EraseStarted,
        EraseUnlock1,
        EraseUnlock2,
    }

    impl MockRomBus {
        fn new(fill: u8) -> Self {
            Self {
                memory: vec![fill; MEMORY_SIZE],
                a_pins: 0,
                b_pins: 0,
                data_latch: 0,
                direction: BusDirection::Input,
                ce: Level::High,
                oe: Level::High,
                we: Level::High,
                in_critical: false,
                id_mode: false,
                state: CommandState::Idle,
                busy_reads: 0,
                stuck_busy: false,
            }
        }

        /// Reassemble the logical address from the pin states.
        fn address(&self) -> u32 {
            let mut address = 0u32;
            for (bit, pin) in [(9, 7), (10, 10), (11, 9), (17, 1)] {
                if self.a_pins & (1 << pin) != 0 {
                    address |= 1 << bit;
                }
            }
            for (bit, pin) in [
                (0, 0),
                (1, 1),
                (2, 2),
                (3, 4),
                (4, 5),
                (5, 6),
                (6, 7),
                (7, 8),
                (8, 13),
                (12, 9),
                (13, 14),
                (14, 15),
                (15, 10),
                (16, 12),
            ] {
                if self.b_pins & (1 << pin) != 0 {
                    address |= 1 << bit;
                }
            }
            address
        }

        fn begin_busy(&mut self) {
            self.busy_reads = 3;
        }

        /// A completed write cycle: feed the command state machine.
        fn commit_write(&mut self) {
            assert!(
                self.in_critical,
                "write cycles must run inside a critical section"
            );
            assert_eq!(
                self.direction,
                BusDirection::Output,
                "write cycle with the data bus in input mode"
            );

            let address = self.address();
            let data = self.data_latch;

            self.state = match (self.state, address, data) {
                (CommandState::ProgramPending, _, _) => {
                    let cell = address as usize;
                    // Programming can only clear bits.
                    self.memory[cell] &= data;
                    self.begin_busy();
                    CommandState::Idle
                },
                (CommandState::Idle, 0x5555, 0xAA) => CommandState::Unlock1,
                (CommandState::Unlock1, 0x2AAA, 0x55) => CommandState::Unlock2,
                (CommandState::Unlock2, 0x5555, 0xA0) => CommandState::ProgramPending,
                (CommandState::Unlock2, 0x5555, 0x80) => CommandState::EraseStarted,
                (CommandState::Unlock2, 0x5555, 0x90) => {
                    self.id_mode = true;
                    CommandState::Idle
                },
                (CommandState::Unlock2, 0x5555, 0xF0) => {
                    self.id_mode = false;
                    CommandState::Idle
                },
                (CommandState::EraseStarted, 0x5555, 0xAA) => CommandState::EraseUnlock1,
                (CommandState::EraseUnlock1, 0x2AAA, 0x55) => CommandState::EraseUnlock2,
                (CommandState::EraseUnlock2, _, 0x30) => {
                    let base = (address & SECTOR_BASE_MASK) as usize;
                    self.memory[base..base + SECTOR_SIZE].fill(0xFF);
                    self.begin_busy();
                    CommandState::Idle
                },
                (CommandState::EraseUnlock2, _, 0x10) => {
                    self.memory.fill(0xFF);
                    self.begin_busy();
                    CommandState::Idle
                },
                _ => panic!(
                    "unexpected write cycle {data:#04x} -> {address:#07x} in {:?}",
                    self.state
                ),
            };
        }
    }

    impl RomBus for MockRomBus {
        fn write_address(&mut self, port_a: u32, port_b: u32) {
            self.a_pins = (self.a_pins | (port_a & 0xFFFF)) & !(port_a >> 16);
            self.b_pins = (self.b_pins | (port_b & 0xFFFF)) & !(port_b >> 16);
        }

        fn write_data(&mut self, value: u8) {
            assert_eq!(
                self.direction,
                BusDirection::Output,
                "data drive while the bus is in input mode"
            );
            self.data_latch = value;
        }

        fn read_data(&mut self) -> u8 {
            assert_eq!(self.direction, BusDirection::Input);
            assert_eq!(self.ce, Level::Low, "read with chip enable deasserted");
            assert_eq!(self.oe, Level::Low, "read with output enable deasserted");

            let address = self.address();
            if self.id_mode {
                return match address {
                    0 => SST_MANUFACTURER,
                    1 => SST_DEVICE,
                    _ => 0xFF,
                };
            }

            let value = self.memory[address as usize];
            if self.stuck_busy {
                return value ^ 0x80;
            }
            if self.busy_reads > 0 {
                self.busy_reads -= 1;
                return value ^ 0x80;
            }
            value
        }

        fn set_chip_enable(&mut self, level: Level) {
            self.ce = level;
        }

        fn set_output_enable(&mut self, level: Level) {
            self.oe = level;
        }

        fn set_write_enable(&mut self, level: Level) {
            if self.we == Level::Low && level == Level::High && self.ce == Level::Low {
                self.commit_write();
            }
            self.we = level;
        }

        fn set_data_direction(&mut self, direction: BusDirection) {
            assert_eq!(self.ce, Level::High, "direction change with CE asserted");
            assert_eq!(self.oe, Level::High, "direction change with OE asserted");
            assert_eq!(self.we, Level::High, "direction change with WE asserted");
            self.direction = direction;
        }

        fn delay_ns(&mut self, _ns: u32) {}

        fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
            assert!(!self.in_critical, "critical sections must not nest");
            self.in_critical = true;
            let result = f(self);
            self.in_critical = false;
            result
        }
    }

    struct MockDelay;

    impl Delay for MockDelay {
        fn delay_ticks(&mut self, _ticks: u32) {}

        fn tick_hz(&self) -> u32 {
            1000
        }
    }

    fn flash(fill: u8) -> ParallelNorFlash<MockRomBus, MockDelay> {
        ParallelNorFlash::new(MockRomBus::new(fill), MockDelay)
    }

    #[test]
    fn test_address_fanout_roundtrip() {
        // Every address line alone, plus a few busy patterns, must
        // survive the scatter to pins and back.
        let mut bus = MockRomBus::new(0xFF);

        let mut cases: Vec<u32> = (0..18).map(|bit| 1 << bit).collect();
        cases.extend([0, 0x2AAA, 0x5555, 0x12345, 0x3FFFF]);

        for address in cases {
            bus.write_address(port_a_word(address), port_b_word(address));
            assert_eq!(bus.address(), address, "address {address:#07x}");
        }
    }

    #[test]
    fn test_address_fanout_clears_previous_state() {
        // All-ones followed by all-zeroes: the reset half of each
        // word must clear every pin.
        let mut bus = MockRomBus::new(0xFF);

        bus.write_address(port_a_word(0x3FFFF), port_b_word(0x3FFFF));
        bus.write_address(port_a_word(0), port_b_word(0));

        assert_eq!(bus.address(), 0);
    }

    #[test]
    fn test_read_id() {
        let mut flash = flash(0xFF);

        let (manufacturer, device) = flash.read_id().unwrap();

        assert_eq!(manufacturer, SST_MANUFACTURER);
        assert_eq!(device, SST_DEVICE);
        assert!(!flash.bus.id_mode, "software-ID mode must be exited");
        assert_eq!(flash.bus.direction, BusDirection::Input);
    }

    #[test]
    fn test_sector_erase_fills_only_its_sector() {
        let mut flash = flash(0x00);

        flash.erase(0x12345, EraseKind::Sector).unwrap();

        assert_eq!(flash.bus.memory[0x11FFF], 0x00);
        assert!(flash.bus.memory[0x12000..0x13000].iter().all(|&b| b == 0xFF));
        assert_eq!(flash.bus.memory[0x13000], 0x00);
        assert_eq!(flash.bus.direction, BusDirection::Input);
    }

    #[test]
    fn test_chip_erase_fills_everything() {
        let mut flash = flash(0x00);

        flash.erase(0, EraseKind::Chip).unwrap();

        assert!(flash.bus.memory.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_program_writes_bytes_and_polls() {
        let mut flash = flash(0xFF);

        flash.program(0x100, b"hello, rom").unwrap();

        assert_eq!(&flash.bus.memory[0x100..0x10A], b"hello, rom");
        assert_eq!(flash.bus.direction, BusDirection::Input);
        assert_eq!(
            flash.bus.busy_reads, 0,
            "polling must ride out the busy phase"
        );
    }

    #[test]
    fn test_program_stuck_device_times_out() {
        let mut flash = flash(0xFF);
        flash.bus.stuck_busy = true;

        let result = flash.program(0, &[0x42]);

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(
            flash.bus.direction,
            BusDirection::Input,
            "bus must be left in input mode on the error path"
        );
    }

    #[test]
    fn test_erase_stuck_device_times_out() {
        let mut flash = flash(0x00);
        flash.bus.stuck_busy = true;

        let result = flash.erase(0, EraseKind::Sector);

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_read_sector_returns_contents() {
        let mut flash = flash(0xFF);
        for (i, cell) in flash.bus.memory[0x2000..0x3000].iter_mut().enumerate() {
            *cell = i as u8;
        }

        let mut out = [0u8; SECTOR_SIZE];
        flash.read_sector(0x2000, &mut out).unwrap();

        assert_eq!(out[0], 0);
        assert_eq!(out[255], 255);
        assert_eq!(out[4095], 0xFF);
    }
}
