//! Host serial port backing for [`SerialLine`].
//!
//! This lets the receiver run on a development machine against a real
//! sender (`sz -y`, minicom, a board on the other end of a USB-UART
//! bridge) without any target hardware.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hal::SerialLine;

/// A [`SerialLine`] over a host serial port.
pub struct NativeSerial {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl NativeSerial {
    /// Open a host serial port at the given baud rate, 8N1.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(1000))
            .open()?;

        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }

    /// The port name this line was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialLine for NativeSerial {
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;

        match self.port.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::Timeout(format!("read of {} bytes", buf.len())))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}
