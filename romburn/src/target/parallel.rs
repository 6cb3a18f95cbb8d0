//! Parallel-flash upload orchestration.

use log::debug;

use crate::device::parallel_nor::{
    EraseKind, ParallelNorFlash, SECTOR_BASE_MASK, SECTOR_SIZE,
};
use crate::error::Result;
use crate::hal::{Delay, OutputPin, RomBus, SerialLine};
use crate::protocol::ymodem::{FileSink, Status, YmodemReceiver};

/// Which sector, if any, must be erased before writing `len` bytes at
/// `address`.
///
/// A write that begins on a sector boundary has just entered a fresh
/// sector; a write that straddles a boundary is about to. Either way
/// the sector being entered gets erased, never the one already
/// holding programmed data. YMODEM packets are at most 1024 bytes,
/// so a single write can cross at most one boundary.
fn sector_to_erase(address: u32, len: u32) -> Option<u32> {
    if address & (SECTOR_SIZE as u32 - 1) == 0 {
        return Some(address);
    }

    let last = (address + len - 1) & SECTOR_BASE_MASK;
    (last != address & SECTOR_BASE_MASK).then_some(last)
}

/// A parallel-flash image upload in progress.
///
/// Only a write cursor is tracked; the device erases in fixed 4 KiB
/// sectors as the cursor reaches them.
pub struct ParallelRomUpload<'a, B, D, L> {
    flash: &'a mut ParallelNorFlash<B, D>,
    indicator: &'a mut L,
    address: u32,
}

impl<'a, B, D, L> ParallelRomUpload<'a, B, D, L>
where
    B: RomBus,
    D: Delay,
    L: OutputPin,
{
    /// Bind an upload to the flash and the activity indicator.
    pub fn new(flash: &'a mut ParallelNorFlash<B, D>, indicator: &'a mut L) -> Self {
        Self {
            flash,
            indicator,
            address: 0,
        }
    }
}

impl<B, D, L> FileSink for ParallelRomUpload<'_, B, D, L>
where
    B: RomBus,
    D: Delay,
    L: OutputPin,
{
    fn open(&mut self, filename: &str, _size: Option<u32>) -> Result<()> {
        debug!("programming parallel flash from {filename:?}");

        self.address = 0;
        self.indicator.set_high();

        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u32;

        if let Some(sector) = sector_to_erase(self.address, len) {
            self.flash.erase(sector, EraseKind::Sector)?;
        }

        self.flash.program(self.address, data)?;
        self.address += len;

        Ok(())
    }

    fn close(&mut self, _status: Status) {
        self.indicator.set_low();
    }
}

/// Receive a ROM image over YMODEM and program it into the parallel
/// flash, starting at address 0.
pub fn upload_parallel_rom<P, B, D, L, G>(
    port: &mut P,
    flash: &mut ParallelNorFlash<B, D>,
    indicator: &mut L,
    delay: &mut G,
) -> Result<()>
where
    P: SerialLine,
    B: RomBus,
    D: Delay,
    L: OutputPin,
    G: Delay,
{
    delay.delay_ticks(super::SETUP_GRACE_SECS * delay.tick_hz());

    let result = {
        let mut sink = ParallelRomUpload::new(flash, indicator);
        YmodemReceiver::new().receive(port, &mut sink)
    };

    indicator.set_low();
    result
}
