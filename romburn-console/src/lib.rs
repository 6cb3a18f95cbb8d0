//! # romburn-console
//!
//! The interactive operator console of the ROM programmer: a
//! single-character command loop on the serial line that drives the
//! info, peek and upload operations of the [`romburn`] core.
//!
//! The console owns the serial line, both flash drivers and the
//! activity indicator, and hands them to the core's upload entry
//! points when a transfer is requested. Like the rest of the system
//! it is generic over the HAL traits, so it runs wherever a board
//! support layer provides them.

pub mod hexdump;

use std::time::Duration;

use log::warn;

use romburn::Error;
use romburn::device::parallel_nor::{ParallelNorFlash, SECTOR_SIZE};
use romburn::device::spi_nor::{PAGE_SIZE, SpiNorFlash};
use romburn::hal::{Delay, OutputPin, RomBus, SerialLine, SpiBus};
use romburn::{upload_parallel_rom, upload_spi_rom};

/// Show the welcome banner.
const CMD_HELLO: u8 = b'h';
/// Show the help message.
const CMD_HELP: u8 = b'?';
/// Retrieve serial-flash information.
const CMD_SPI_INFO: u8 = b'i';
/// Upload a serial-flash image.
const CMD_SPI_UPLOAD: u8 = b'u';
/// Dump the first page of the serial flash.
const CMD_SPI_PEEK: u8 = b'p';
/// Retrieve parallel-flash information.
const CMD_PARALLEL_INFO: u8 = b'x';
/// Dump parallel-flash data at the peek cursor.
const CMD_PARALLEL_PEEK: u8 = b'o';
/// Jump the peek cursor to the monitor region and dump it.
const CMD_PARALLEL_JUMP: u8 = b'z';
/// Upload a parallel-flash image.
const CMD_PARALLEL_UPLOAD: u8 = b'r';

/// Where the `z` command points the peek cursor.
const JUMP_PEEK_ADDRESS: u32 = 0x12000;

/// Bytes shown per parallel peek.
const PEEK_SPAN: usize = 512;

/// Timeout for console output; the operator's terminal is always
/// draining, so this only bounds a wedged line.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long one idle wait for a command byte lasts.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const WELCOME: &str = "romburn programmer online\r\n? for help\r\n";

const HELP: &str = "romburn commands:\r\n\
    \x20 ? - help\r\n\
    \x20 h - hello\r\n\
    \x20 i - serial flash information\r\n\
    \x20 p - peek serial flash data\r\n\
    \x20 u - upload serial flash image\r\n\
    \x20 x - parallel flash information\r\n\
    \x20 o - peek parallel flash data\r\n\
    \x20 r - upload parallel flash image\r\n";

const UNRECOGNISED: &str = "Unrecognised command\r\n";

const READY: &str = "ready to receive file... ";

/// The operator console.
///
/// One long-lived value per board, owning everything the commands
/// touch.
pub struct Console<P, SPI, CS, SD, B, PD, L, G> {
    serial: P,
    spi_rom: SpiNorFlash<SPI, CS, SD>,
    parallel_rom: ParallelNorFlash<B, PD>,
    indicator: L,
    delay: G,
    peek_address: u32,
}

impl<P, SPI, CS, SD, B, PD, L, G> Console<P, SPI, CS, SD, B, PD, L, G>
where
    P: SerialLine,
    SPI: SpiBus,
    CS: OutputPin,
    SD: Delay,
    B: RomBus,
    PD: Delay,
    L: OutputPin,
    G: Delay,
{
    /// Assemble the console from its collaborators.
    pub fn new(
        serial: P,
        spi_rom: SpiNorFlash<SPI, CS, SD>,
        parallel_rom: ParallelNorFlash<B, PD>,
        indicator: L,
        delay: G,
    ) -> Self {
        Self {
            serial,
            spi_rom,
            parallel_rom,
            indicator,
            delay,
            peek_address: 0,
        }
    }

    /// Run the command loop until the serial line fails.
    ///
    /// Idle timeouts just wait again; any other transport error is
    /// fatal and propagates.
    pub fn run(&mut self) -> romburn::Result<()> {
        self.print(WELCOME)?;

        loop {
            let mut command = [0u8; 1];
            match self.serial.receive(&mut command, IDLE_TIMEOUT) {
                Ok(()) => self.dispatch(command[0])?,
                Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute one command byte.
    pub fn dispatch(&mut self, command: u8) -> romburn::Result<()> {
        match command {
            CMD_HELLO => self.print(WELCOME),
            CMD_HELP => self.print(HELP),
            CMD_SPI_INFO => self.spi_info(),
            CMD_SPI_PEEK => self.spi_peek(),
            CMD_SPI_UPLOAD => self.spi_upload(),
            CMD_PARALLEL_INFO => self.parallel_info(),
            CMD_PARALLEL_PEEK => self.parallel_peek(),
            CMD_PARALLEL_JUMP => {
                self.peek_address = JUMP_PEEK_ADDRESS;
                self.parallel_peek()
            },
            CMD_PARALLEL_UPLOAD => self.parallel_upload(),
            other => {
                warn!("unrecognised command {other:#04x}");
                self.print(UNRECOGNISED)
            },
        }
    }

    fn spi_info(&mut self) -> romburn::Result<()> {
        match self.spi_rom.read_jedec_id() {
            Ok((manufacturer, device)) => self.print(&format!(
                "Manufacturer: {manufacturer:02x}\r\nDevice ID: {device:04x}\r\n"
            )),
            Err(e) => self.report_error(&e),
        }
    }

    fn spi_peek(&mut self) -> romburn::Result<()> {
        let mut page = [0u8; PAGE_SIZE];
        if let Err(e) = self.spi_rom.read_page(0, &mut page) {
            return self.report_error(&e);
        }

        for row in page.chunks_exact(16) {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(row);
            self.print(&hexdump::dump_line(&bytes))?;
        }

        Ok(())
    }

    fn parallel_info(&mut self) -> romburn::Result<()> {
        match self.parallel_rom.read_id() {
            Ok((manufacturer, device)) => {
                // Device information also rewinds the peek cursor.
                self.peek_address = 0;
                self.print(&format!(
                    "Manufacturer: {manufacturer:02x}\r\nDevice ID: {device:02x}\r\n"
                ))
            },
            Err(e) => self.report_error(&e),
        }
    }

    fn parallel_peek(&mut self) -> romburn::Result<()> {
        let mut sector = [0u8; SECTOR_SIZE];
        if let Err(e) = self.parallel_rom.read_sector(self.peek_address, &mut sector) {
            return self.report_error(&e);
        }

        for (index, row) in sector[..PEEK_SPAN].chunks_exact(16).enumerate() {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(row);
            self.print(&hexdump::dump_line_at(
                self.peek_address + (index * 16) as u32,
                &bytes,
            ))?;
        }
        self.peek_address += PEEK_SPAN as u32;

        Ok(())
    }

    fn spi_upload(&mut self) -> romburn::Result<()> {
        self.print(READY)?;

        let result = upload_spi_rom(
            &mut self.serial,
            &mut self.spi_rom,
            &mut self.indicator,
            &mut self.delay,
        );

        self.finish_upload(result)
    }

    fn parallel_upload(&mut self) -> romburn::Result<()> {
        self.print(READY)?;

        let result = upload_parallel_rom(
            &mut self.serial,
            &mut self.parallel_rom,
            &mut self.indicator,
            &mut self.delay,
        );

        self.finish_upload(result)
    }

    /// Report an upload outcome once the sender has gone quiet.
    fn finish_upload(&mut self, result: romburn::Result<()>) -> romburn::Result<()> {
        // Let the host's sender finish its own teardown before the
        // result lands in the operator's terminal.
        self.delay.delay_ticks(self.delay.tick_hz());

        match result {
            Ok(()) => self.print("OK!\r\n"),
            Err(e) => self.report_transfer_error(&e),
        }
    }

    fn report_transfer_error(&mut self, error: &Error) -> romburn::Result<()> {
        self.print(&format!("transfer failed: {error}\r\n"))
    }

    fn report_error(&mut self, error: &Error) -> romburn::Result<()> {
        self.print(&format!("Error: {error}\r\n"))
    }

    fn print(&mut self, text: &str) -> romburn::Result<()> {
        self.serial.send(text.as_bytes(), WRITE_TIMEOUT)
    }
}
