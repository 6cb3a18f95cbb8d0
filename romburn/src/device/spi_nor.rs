//! Serial NOR flash driver (W25Q32 family).
//!
//! The memory is arranged as 256-byte pages; erasing operates on 4 KiB
//! sectors, 32 KiB blocks or 64 KiB blocks. Every erase or program is
//! preceded by a write-enable command and followed by a busy-poll of
//! the status register. The driver speaks plain one-bit SPI only.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::hal::{Delay, OutputPin, SpiBus};

/// Programming page size in bytes; program commands never cross a
/// page boundary.
pub const PAGE_SIZE: usize = 256;

/// JEDEC manufacturer ID for Winbond.
pub const MANUFACTURER_WINBOND: u8 = 0xEF;

/// Device ID of the W25Q32 part this programmer targets.
pub const DEVICE_W25Q32: u16 = 0x4016;

/// How long a busy-poll waits before giving up, in seconds.
const BUSY_POLL_SECS: u32 = 3;

/// Command opcodes understood by the device.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Opcode {
    /// Read the JEDEC manufacturer/device identification.
    JedecId = 0x9F,
    /// Read status register 1.
    ReadStatus = 0x05,
    /// Set the write-enable latch.
    WriteEnable = 0x06,
    /// Program up to one page.
    PageProgram = 0x02,
    /// Fast read; one dummy byte follows the address.
    FastRead = 0x0B,
    /// Erase a 4 KiB sector.
    SectorErase = 0x20,
    /// Erase a 32 KiB block.
    BlockErase = 0x52,
    /// Erase a 64 KiB block.
    LargeBlockErase = 0xD8,
}

bitflags! {
    /// Status register 1 bits.
    struct StatusRegister: u8 {
        /// Erase or program in progress.
        const BUSY = 1 << 0;
        /// Write-enable latch.
        const WEL = 1 << 1;
    }
}

/// Erase granularities offered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseKind {
    /// 4 KiB sector.
    Sector,
    /// 32 KiB block.
    Block,
    /// 64 KiB block.
    LargeBlock,
}

impl EraseKind {
    /// Bytes covered by one erase of this kind.
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            Self::Sector => 4 * 1024,
            Self::Block => 32 * 1024,
            Self::LargeBlock => 64 * 1024,
        }
    }

    fn opcode(self) -> Opcode {
        match self {
            Self::Sector => Opcode::SectorErase,
            Self::Block => Opcode::BlockErase,
            Self::LargeBlock => Opcode::LargeBlockErase,
        }
    }
}

/// Driver for a serial NOR flash on a dedicated chip select.
///
/// The bus is owned for the duration of each chip-select assertion;
/// nothing else may transact while a frame is open. On an error in
/// the middle of an erase or program sequence the device state is
/// undefined.
pub struct SpiNorFlash<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
}

impl<SPI, CS, D> SpiNorFlash<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: Delay,
{
    /// Take ownership of the bus, chip-select pin and delay source.
    /// The chip select is released immediately.
    pub fn new(spi: SPI, mut cs: CS, delay: D) -> Self {
        cs.set_high();
        Self { spi, cs, delay }
    }

    /// Tear the driver down, handing the bus, chip select and delay
    /// source back.
    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    /// Read the JEDEC identification: (manufacturer, 16-bit device ID).
    pub fn read_jedec_id(&mut self) -> Result<(u8, u16)> {
        let mut frame = [Opcode::JedecId as u8, 0, 0, 0];

        self.selected(|flash| flash.spi.transfer(&mut frame))?;

        let manufacturer = frame[1];
        let device = BigEndian::read_u16(&frame[2..4]);
        trace!("JEDEC id: manufacturer {manufacturer:#04x}, device {device:#06x}");

        Ok((manufacturer, device))
    }

    /// Erase the region of the given granularity containing `address`.
    ///
    /// The address is aligned down to the erase boundary. Blocks until
    /// the device reports ready, or fails with a timeout after three
    /// seconds.
    pub fn erase(&mut self, address: u32, kind: EraseKind) -> Result<()> {
        let address = address & !(kind.size() - 1);
        debug!("erase {:?} at {address:#08x}", kind);

        self.write_enable()?;

        let frame = command_frame(kind.opcode(), address);
        self.selected(|flash| flash.spi.write(&frame))?;

        self.wait_while_busy()
    }

    /// Program `data` starting at `address`.
    ///
    /// The input is split into runs that never cross a 256-byte page
    /// boundary; each run is its own write-enable, command frame and
    /// busy-wait. The region must have been erased beforehand.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut address = address;
        let mut data = data;

        while !data.is_empty() {
            let run = (PAGE_SIZE - (address as usize % PAGE_SIZE)).min(data.len());
            let (chunk, rest) = data.split_at(run);

            self.write_enable()?;

            let frame = command_frame(Opcode::PageProgram, address);
            self.selected(|flash| {
                flash.spi.write(&frame)?;
                flash.spi.write(chunk)
            })?;

            self.wait_while_busy()?;

            address += run as u32;
            data = rest;
        }

        Ok(())
    }

    /// Read one 256-byte page. `address` must be page-aligned.
    pub fn read_page(&mut self, address: u32, out: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if address as usize % PAGE_SIZE != 0 {
            return Err(Error::Misaligned {
                address,
                alignment: PAGE_SIZE as u32,
            });
        }

        // Fast read wants one dummy byte between address and data.
        let mut frame = [0u8; 5];
        frame[0] = Opcode::FastRead as u8;
        BigEndian::write_u24(&mut frame[1..4], address);

        self.selected(|flash| {
            flash.spi.write(&frame)?;
            flash.spi.transfer(out)
        })
    }

    /// Set the write-enable latch; required before every erase and
    /// every page program.
    fn write_enable(&mut self) -> Result<()> {
        self.selected(|flash| flash.spi.write(&[Opcode::WriteEnable as u8]))
    }

    /// Poll the status register until BUSY clears.
    ///
    /// The chip select stays asserted with the read-status opcode sent
    /// once; each subsequent byte shifted out re-samples the register.
    /// Sleeps one tick between polls and abandons after three seconds.
    fn wait_while_busy(&mut self) -> Result<()> {
        let polls = BUSY_POLL_SECS * self.delay.tick_hz();

        self.cs.set_low();
        let result = self.poll_status(polls);
        self.cs.set_high();

        result
    }

    fn poll_status(&mut self, polls: u32) -> Result<()> {
        self.spi.write(&[Opcode::ReadStatus as u8])?;

        for _ in 0..polls {
            let mut status = [0u8];
            self.spi.transfer(&mut status)?;

            if !StatusRegister::from_bits_retain(status[0]).contains(StatusRegister::BUSY) {
                return Ok(());
            }

            self.delay.delay_ticks(1);
        }

        Err(Error::Timeout("flash busy-wait".into()))
    }

    /// Run `f` with the chip select asserted, releasing it on every
    /// exit path.
    fn selected<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.cs.set_low();
        let result = f(self);
        self.cs.set_high();
        result
    }
}

/// Build an opcode + 24-bit big-endian address frame.
fn command_frame(opcode: Opcode, address: u32) -> [u8; 4] {
    let mut frame = [0u8; 4];
    frame[0] = opcode as u8;
    BigEndian::write_u24(&mut frame[1..4], address);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Everything observed on the bus, in order, split into events so
    /// that tests can assert on whole chip-select frames.
    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        CsLow,
        CsHigh,
        Write(Vec<u8>),
        Transfer(Vec<u8>),
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    /// Scripted SPI bus: writes are recorded, transfers consume the
    /// response queue (zeroes once exhausted).
    struct MockSpi {
        log: Log,
        responses: VecDeque<u8>,
    }

    impl SpiBus for MockSpi {
        fn transfer(&mut self, data: &mut [u8]) -> crate::Result<()> {
            let sent = data.to_vec();
            for slot in data.iter_mut() {
                *slot = self.responses.pop_front().unwrap_or(0);
            }
            self.log.borrow_mut().push(Event::Transfer(sent));
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> crate::Result<()> {
            self.log.borrow_mut().push(Event::Write(data.to_vec()));
            Ok(())
        }
    }

    struct MockCs {
        log: Log,
    }

    impl OutputPin for MockCs {
        fn set_high(&mut self) {
            self.log.borrow_mut().push(Event::CsHigh);
        }

        fn set_low(&mut self) {
            self.log.borrow_mut().push(Event::CsLow);
        }
    }

    struct MockDelay;

    impl Delay for MockDelay {
        fn delay_ticks(&mut self, _ticks: u32) {}

        fn tick_hz(&self) -> u32 {
            1000
        }
    }

    fn flash_with(responses: &[u8]) -> (SpiNorFlash<MockSpi, MockCs, MockDelay>, Log) {
        let log: Log = Rc::default();
        let spi = MockSpi {
            log: Rc::clone(&log),
            responses: responses.iter().copied().collect(),
        };
        let cs = MockCs {
            log: Rc::clone(&log),
        };
        let flash = SpiNorFlash::new(spi, cs, MockDelay);
        log.borrow_mut().clear();
        (flash, log)
    }

    /// All Write frames, flattened per chip-select window.
    fn frames(log: &Log) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for event in log.borrow().iter() {
            match event {
                Event::CsLow => current = Some(Vec::new()),
                Event::CsHigh => {
                    if let Some(f) = current.take() {
                        out.push(f);
                    }
                },
                Event::Write(bytes) => {
                    if let Some(f) = current.as_mut() {
                        f.extend_from_slice(bytes);
                    }
                },
                Event::Transfer(_) => {},
            }
        }
        out
    }

    #[test]
    fn test_read_jedec_id() {
        // W25Q32: EF 40 16 after the opcode byte.
        let (mut flash, log) = flash_with(&[0x00, 0xEF, 0x40, 0x16]);

        let (manufacturer, device) = flash.read_jedec_id().unwrap();

        assert_eq!(manufacturer, MANUFACTURER_WINBOND);
        assert_eq!(device, DEVICE_W25Q32);

        let events = log.borrow();
        assert_eq!(events[0], Event::CsLow);
        assert_eq!(events[1], Event::Transfer(vec![0x9F, 0, 0, 0]));
        assert_eq!(events[2], Event::CsHigh);
    }

    #[test]
    fn test_erase_sends_write_enable_then_command() {
        // Status: not busy on the first poll.
        let (mut flash, log) = flash_with(&[0x00]);

        flash.erase(0x0001_2345, EraseKind::Sector).unwrap();

        let frames = frames(&log);
        assert_eq!(frames[0], vec![0x06]);
        // Address aligned down to the 4 KiB boundary, big-endian.
        assert_eq!(frames[1], vec![0x20, 0x01, 0x20, 0x00]);
        // Busy-poll frame: read-status opcode only (the polls are
        // transfers).
        assert_eq!(frames[2], vec![0x05]);
    }

    #[test]
    fn test_erase_kinds_use_their_opcodes() {
        for (kind, opcode) in [
            (EraseKind::Sector, 0x20),
            (EraseKind::Block, 0x52),
            (EraseKind::LargeBlock, 0xD8),
        ] {
            let (mut flash, log) = flash_with(&[0x00]);
            flash.erase(0x0002_0000, kind).unwrap();
            assert_eq!(frames(&log)[1][0], opcode, "{kind:?}");
        }
    }

    #[test]
    fn test_erase_waits_out_busy_device() {
        // Busy twice, then ready.
        let (mut flash, log) = flash_with(&[0x03, 0x03, 0x00]);

        flash.erase(0, EraseKind::LargeBlock).unwrap();

        let polls = log
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Transfer(_)))
            .count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_erase_busy_forever_times_out() {
        // A device whose BUSY bit never clears must be abandoned
        // after the three-second poll budget.
        struct BusySpi;
        impl SpiBus for BusySpi {
            fn transfer(&mut self, data: &mut [u8]) -> crate::Result<()> {
                for slot in data.iter_mut() {
                    *slot = 0x01;
                }
                Ok(())
            }
            fn write(&mut self, _data: &[u8]) -> crate::Result<()> {
                Ok(())
            }
        }
        struct NullPin;
        impl OutputPin for NullPin {
            fn set_high(&mut self) {}
            fn set_low(&mut self) {}
        }

        let mut busy = SpiNorFlash::new(BusySpi, NullPin, MockDelay);
        let result = busy.erase(0, EraseKind::Sector);

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_program_chunks_at_page_boundaries() {
        // 300 bytes starting at 0x80: runs of 128, 172.
        let (mut flash, log) = flash_with(&[]);
        let image: Vec<u8> = (0..300).map(|i| i as u8).collect();

        flash.program(0x80, &image).unwrap();

        let frames = frames(&log);
        // write-enable, program, status / write-enable, program, status
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0], vec![0x06]);
        assert_eq!(&frames[1][..4], [0x02, 0x00, 0x00, 0x80]);
        assert_eq!(frames[1].len(), 4 + 128);
        assert_eq!(frames[3], vec![0x06]);
        assert_eq!(&frames[4][..4], [0x02, 0x00, 0x01, 0x00]);
        assert_eq!(frames[4].len(), 4 + 172);
        // Payload bytes pass through unchanged.
        assert_eq!(&frames[1][4..], &image[..128]);
        assert_eq!(&frames[4][4..], &image[128..]);
    }

    #[test]
    fn test_program_page_aligned_single_run() {
        let (mut flash, log) = flash_with(&[]);

        flash.program(0x100, &[0xAB; 256]).unwrap();

        let frames = frames(&log);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].len(), 4 + 256);
    }

    #[test]
    fn test_read_page_rejects_unaligned_address() {
        let (mut flash, log) = flash_with(&[]);
        let mut page = [0u8; PAGE_SIZE];

        let result = flash.read_page(0x101, &mut page);

        assert!(matches!(result, Err(Error::Misaligned { .. })));
        assert!(log.borrow().is_empty(), "bus must not be touched");
    }

    #[test]
    fn test_read_page_sends_fast_read_with_dummy() {
        let responses: Vec<u8> = (0..=255u8).collect();
        let (mut flash, log) = flash_with(&responses);
        let mut page = [0u8; PAGE_SIZE];

        flash.read_page(0x200, &mut page).unwrap();

        let events = log.borrow();
        assert_eq!(events[0], Event::CsLow);
        // Opcode, 24-bit address, one dummy byte.
        assert_eq!(events[1], Event::Write(vec![0x0B, 0x00, 0x02, 0x00, 0x00]));
        assert!(matches!(events[2], Event::Transfer(_)));
        assert_eq!(events[3], Event::CsHigh);
        assert_eq!(page[0], 0);
        assert_eq!(page[255], 255);
    }
}
