//! Serial-flash upload orchestration.

use log::debug;

use crate::device::spi_nor::{
    DEVICE_W25Q32, EraseKind, MANUFACTURER_WINBOND, SpiNorFlash,
};
use crate::error::{Error, Result};
use crate::hal::{Delay, OutputPin, SerialLine, SpiBus};
use crate::protocol::ymodem::{FileSink, Status, YmodemReceiver};

/// Pick the largest erase that both fits what is left of the image
/// and stays aligned.
///
/// Starting with the biggest granularity keeps later erases aligned:
/// once the erased frontier is a 64 KiB multiple, a 32 KiB erase next
/// lands on a 32 KiB boundary, and so on down to sectors. `filesize`
/// of zero means the sender declared none; the current packet length
/// stands in so an unsized stream still erases at least a sector
/// ahead of every write.
fn erase_step(filesize: u32, address: u32, packet_len: u32) -> EraseKind {
    let remaining = if address >= filesize {
        packet_len
    } else {
        filesize - address
    };

    if remaining > 64 * 1024 {
        EraseKind::LargeBlock
    } else if remaining > 32 * 1024 {
        EraseKind::Block
    } else {
        EraseKind::Sector
    }
}

/// A serial-flash image upload in progress.
///
/// `erased` tracks the first offset not yet known to be erased; it
/// never falls behind `address`, so every byte is programmed into
/// freshly erased flash.
pub struct SpiRomUpload<'a, SPI, CS, D, L> {
    flash: &'a mut SpiNorFlash<SPI, CS, D>,
    indicator: &'a mut L,
    address: u32,
    erased: u32,
    filesize: u32,
}

impl<'a, SPI, CS, D, L> SpiRomUpload<'a, SPI, CS, D, L>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: Delay,
    L: OutputPin,
{
    /// Bind an upload to the flash and the activity indicator.
    pub fn new(flash: &'a mut SpiNorFlash<SPI, CS, D>, indicator: &'a mut L) -> Self {
        Self {
            flash,
            indicator,
            address: 0,
            erased: 0,
            filesize: 0,
        }
    }
}

impl<SPI, CS, D, L> FileSink for SpiRomUpload<'_, SPI, CS, D, L>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: Delay,
    L: OutputPin,
{
    fn open(&mut self, filename: &str, size: Option<u32>) -> Result<()> {
        // Refuse to program anything that does not identify as the
        // part this board is wired for.
        let (manufacturer, device) = self.flash.read_jedec_id()?;
        if manufacturer != MANUFACTURER_WINBOND || device != DEVICE_W25Q32 {
            return Err(Error::UnknownDevice {
                manufacturer,
                device,
            });
        }

        debug!("programming serial flash from {filename:?}");

        self.address = 0;
        self.erased = 0;
        self.filesize = size.unwrap_or(0);
        self.indicator.set_high();

        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.erased <= self.address {
            let kind = erase_step(self.filesize, self.address, data.len() as u32);
            self.flash.erase(self.address, kind)?;
            self.erased += kind.size();
        }

        self.flash.program(self.address, data)?;
        self.address += data.len() as u32;

        Ok(())
    }

    fn close(&mut self, _status: Status) {
        self.indicator.set_low();
    }
}

/// Receive a ROM image over YMODEM and program it into the serial
/// flash, starting at address 0.
///
/// Waits a few seconds first so the operator can start the sender on
/// the host. The indicator is forced low on the way out in case the
/// session died before a file was ever opened.
pub fn upload_spi_rom<P, SPI, CS, D, L, G>(
    port: &mut P,
    flash: &mut SpiNorFlash<SPI, CS, D>,
    indicator: &mut L,
    delay: &mut G,
) -> Result<()>
where
    P: SerialLine,
    SPI: SpiBus,
    CS: OutputPin,
    D: Delay,
    L: OutputPin,
    G: Delay,
{
    delay.delay_ticks(super::SETUP_GRACE_SECS * delay.tick_hz());

    let result = {
        let mut sink = SpiRomUpload::new(flash, indicator);
        YmodemReceiver::new().receive(port, &mut sink)
    };

    indicator.set_low();
    result
}
