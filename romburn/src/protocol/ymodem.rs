//! YMODEM-CRC file reception.
//!
//! This module implements the receiving side of the YMODEM batch
//! protocol, which is how ROM images arrive from the operator's host.
//!
//! ## Protocol Overview
//!
//! A framed packet looks like:
//!
//! ```text
//! +---------+-----+------+------------------+--------+
//! | SOH/STX | SEQ | ~SEQ | DATA (128/1024)  | CRC16  |
//! +---------+-----+------+------------------+--------+
//! | 1       | 1   | 1    |   128 or 1024    | 2      |
//! +---------+-----+------+------------------+--------+
//! ```
//!
//! Block 0 of each file carries metadata (NUL-terminated filename,
//! then an optional ASCII-decimal size); data blocks follow with
//! sequence numbers 1, 2, ... wrapping at 256. A lone EOT ends a
//! file, and a block 0 with an empty filename ends the batch. The
//! receiver advertises CRC-16 mode by sending `C`.
//!
//! Received bytes are handed to a caller-supplied [`FileSink`]; the
//! receiver itself knows nothing about flash devices.

use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hal::SerialLine;
use crate::protocol::crc::crc16_xmodem;

/// YMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Block size for SOH packets.
pub const SOH_BLOCK_SIZE: usize = 128;

/// Block size for STX packets (YMODEM-1K).
pub const STX_BLOCK_SIZE: usize = 1024;

/// Header, sequence, complement and CRC bytes around a payload.
const PACKET_OVERHEAD: usize = 5;

/// One receive buffer: the largest framed packet.
const PACKET_BUFFER: usize = STX_BLOCK_SIZE + PACKET_OVERHEAD;

/// YMODEM receiver timing and retry configuration.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Timeout for the packet header byte.
    pub header_timeout: Duration,
    /// Timeout for the body of a packet once the header arrived.
    pub packet_timeout: Duration,
    /// Per-byte timeout while draining the line before a retry.
    pub drain_timeout: Duration,
    /// Read attempts per packet before giving up.
    pub max_retries: u32,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(10),
            packet_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(100),
            max_retries: 10,
        }
    }
}

/// Final disposition of a file transfer, as reported to
/// [`FileSink::close`] and collapsed from richer internal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The file arrived intact.
    Ok,
    /// The line went quiet past the retry budget.
    Timeout,
    /// Framing, sequencing or sink failure.
    Error,
    /// The sender cancelled the session.
    Cancel,
}

/// Consumer of a received file's bytes.
///
/// The receiver calls `open` once per file, `write` once per accepted
/// data packet in order, and `close` exactly once per accepted `open`.
/// If `open` returns an error the file is rejected, the session is
/// cancelled, and `close` is NOT called for it.
pub trait FileSink {
    /// A file is about to be transferred. `size` is the sender's
    /// declared length, or `None` when the metadata carried none.
    /// Returning an error rejects the transfer.
    fn open(&mut self, filename: &str, size: Option<u32>) -> Result<()>;

    /// Consume the next run of file bytes. Padding past a declared
    /// size has already been stripped. Returning an error aborts the
    /// session.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// The transfer ended; no further `write` calls will follow.
    fn close(&mut self, status: Status);
}

/// What a successful packet read produced.
enum Packet {
    /// A framed SOH/STX packet of the given payload size, now
    /// validated and sitting in the receive buffer.
    Data(usize),
    /// A bare end-of-transmission byte.
    Eot,
}

/// YMODEM batch receiver.
///
/// Owns the single packet buffer for its lifetime, so constructing a
/// receiver once per session keeps packet handling allocation-free.
/// The receiver is not reentrant; one session runs at a time.
pub struct YmodemReceiver {
    config: YmodemConfig,
    buffer: [u8; PACKET_BUFFER],
}

impl Default for YmodemReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl YmodemReceiver {
    /// Create a receiver with the standard timings (10 s header,
    /// 1 s packet body, 100 ms drain, 10 retries).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(YmodemConfig::default())
    }

    /// Create a receiver with custom timings.
    #[must_use]
    pub fn with_config(config: YmodemConfig) -> Self {
        Self {
            config,
            buffer: [0; PACKET_BUFFER],
        }
    }

    /// Receive zero or more files, feeding each to `sink`.
    ///
    /// Blocks until the batch completes, the sender cancels, or the
    /// retry budget is exhausted. Returns `Ok(())` only for a clean
    /// batch termination (empty-filename metadata block).
    pub fn receive<P, S>(&mut self, port: &mut P, sink: &mut S) -> Result<()>
    where
        P: SerialLine,
        S: FileSink,
    {
        loop {
            // Advertise CRC-16 mode and wait for a metadata block.
            port.send(&[control::C], self.config.packet_timeout)?;

            let len = match self.read_packet(port, control::C)? {
                Packet::Data(len) => len,
                Packet::Eot => {
                    // The ACK for a previous EOT was lost and our 'C'
                    // provoked a retransmission. ACK it again.
                    let _ = port.send(&[control::ACK], self.config.packet_timeout);
                    continue;
                },
            };

            // Metadata is always block zero. Anything else means the
            // two ends disagree about where we are.
            if self.buffer[1] != 0x00 || self.buffer[2] != 0xFF {
                self.send_cancel(port);
                return Err(Error::Protocol("metadata block out of sequence".into()));
            }

            // An empty filename is the batch terminator.
            if self.buffer[3] == 0 {
                let _ = port.send(&[control::ACK], self.config.packet_timeout);
                return Ok(());
            }

            let (filename, size) = parse_metadata(&self.buffer[3..3 + len]);
            debug!("incoming file {filename:?}, declared size {size:?}");

            if let Err(e) = sink.open(&filename, size) {
                // Rejected before it began: no close for this file.
                self.send_cancel(port);
                return Err(e);
            }

            let _ = port.send(&[control::ACK], self.config.packet_timeout);
            let _ = port.send(&[control::C], self.config.packet_timeout);

            self.receive_file(port, sink, size)?;
        }
    }

    /// Receive the data blocks of one opened file.
    ///
    /// `close` is called on every path out of here; the caller has
    /// already guaranteed a successful `open`.
    fn receive_file<P, S>(&mut self, port: &mut P, sink: &mut S, size: Option<u32>) -> Result<()>
    where
        P: SerialLine,
        S: FileSink,
    {
        let mut remaining = size;
        let mut block_number: u32 = 1;

        loop {
            // The first data block may follow a lost 'C', so that is
            // the prompt to repeat; afterwards a NAK asks for the
            // block again.
            let prompt = if block_number == 1 {
                control::C
            } else {
                control::NAK
            };

            let packet = match self.read_packet(port, prompt) {
                Ok(packet) => packet,
                Err(e) => {
                    self.send_cancel(port);
                    sink.close(e.status());
                    return Err(e);
                },
            };

            let len = match packet {
                Packet::Data(len) => len,
                Packet::Eot => {
                    if remaining.unwrap_or(0) != 0 {
                        // The sender gave up mid-file, or we lost
                        // track. Either way the image is short.
                        sink.close(Status::Error);
                        self.send_cancel(port);
                        return Err(Error::Protocol(
                            "end of transmission before declared size".into(),
                        ));
                    }

                    sink.close(Status::Ok);
                    let _ = port.send(&[control::ACK], self.config.packet_timeout);
                    return Ok(());
                },
            };

            let sequence = self.buffer[1];
            let expected = (block_number & 0xFF) as u8;

            if sequence != expected {
                if sequence == (block_number.wrapping_sub(1) & 0xFF) as u8 {
                    // Our ACK was lost and the sender repeated the
                    // block we already consumed. ACK again, deliver
                    // nothing.
                    trace!("duplicate block {sequence}, re-acknowledging");
                    let _ = port.send(&[control::ACK], self.config.packet_timeout);
                    continue;
                }

                sink.close(Status::Error);
                self.send_cancel(port);
                return Err(Error::Protocol(format!(
                    "expected block {expected}, got {sequence}"
                )));
            }

            block_number = block_number.wrapping_add(1);

            // Trim to the declared size so padding never reaches the
            // sink; whole blocks past the end are dropped silently.
            let take = match remaining {
                Some(left) => {
                    let take = len.min(left as usize);
                    remaining = Some(left - take as u32);
                    take
                },
                None => len,
            };

            if take == 0 {
                let _ = port.send(&[control::ACK], self.config.packet_timeout);
                continue;
            }

            if let Err(e) = sink.write(&self.buffer[3..3 + take]) {
                self.send_cancel(port);
                sink.close(e.status());
                return Err(e);
            }

            // A lost ACK surfaces as a duplicate block later, so its
            // send result does not need checking.
            let _ = port.send(&[control::ACK], self.config.packet_timeout);
        }
    }

    /// Read one packet, retrying with the given prompt byte.
    ///
    /// Makes up to `max_retries` attempts. From the second attempt on,
    /// the line is drained of stale bytes and `prompt` is re-sent to
    /// ask the remote end to try again. Sequence-complement and CRC
    /// failures count as attempts; a validated packet lands in the
    /// receive buffer.
    fn read_packet<P: SerialLine>(&mut self, port: &mut P, prompt: u8) -> Result<Packet> {
        let mut failure = Error::Timeout("no packet header".into());

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                let mut scratch = [0u8; 1];
                while port.receive(&mut scratch, self.config.drain_timeout).is_ok() {}
                port.send(&[prompt], self.config.packet_timeout)?;
            }

            let mut header = [0u8; 1];
            match port.receive(&mut header, self.config.header_timeout) {
                Ok(()) => {},
                Err(e @ Error::Timeout(_)) => {
                    failure = e;
                    continue;
                },
                Err(e) => return Err(e),
            }

            match header[0] {
                control::SOH | control::STX => {
                    let size = if header[0] == control::SOH {
                        SOH_BLOCK_SIZE
                    } else {
                        STX_BLOCK_SIZE
                    };

                    self.buffer[0] = header[0];

                    // Sequence pair, payload and CRC trailer arrive
                    // back to back under the tighter body timeout.
                    let body = &mut self.buffer[1..size + PACKET_OVERHEAD];
                    match port.receive(body, self.config.packet_timeout) {
                        Ok(()) => {},
                        Err(e @ Error::Timeout(_)) => {
                            failure = e;
                            continue;
                        },
                        Err(e) => return Err(e),
                    }

                    if self.buffer[1] != !self.buffer[2] {
                        warn!(
                            "sequence complement mismatch: {:#04x}/{:#04x}",
                            self.buffer[1], self.buffer[2]
                        );
                        failure = Error::Protocol("sequence complement mismatch".into());
                        continue;
                    }

                    // CRC over payload plus trailer is zero iff intact.
                    if crc16_xmodem(&self.buffer[3..size + PACKET_OVERHEAD]) != 0 {
                        warn!("CRC mismatch on block {}", self.buffer[1]);
                        failure = Error::Protocol("CRC mismatch".into());
                        continue;
                    }

                    return Ok(Packet::Data(size));
                },
                control::CAN => {
                    // One CAN could be line noise; two in a row is the
                    // sender tearing the session down.
                    let mut second = [0u8; 1];
                    match port.receive(&mut second, self.config.packet_timeout) {
                        Ok(()) if second[0] == control::CAN => return Err(Error::Cancelled),
                        Ok(()) => {
                            failure = Error::Protocol("stray cancel byte".into());
                            continue;
                        },
                        Err(e @ Error::Timeout(_)) => {
                            failure = e;
                            continue;
                        },
                        Err(e) => return Err(e),
                    }
                },
                control::EOT => return Ok(Packet::Eot),
                other => {
                    trace!("unexpected header byte {other:#04x}");
                    failure = Error::Protocol("unexpected header byte".into());
                },
            }
        }

        Err(failure)
    }

    /// Tear the session down from our side.
    fn send_cancel<P: SerialLine>(&mut self, port: &mut P) {
        let _ = port.send(
            &[control::CAN, control::CAN],
            self.config.packet_timeout,
        );
    }
}

/// Split a metadata payload into filename and declared size.
///
/// The filename is NUL-terminated; the size, when present, is a run
/// of ASCII digits immediately after the NUL, ending at the first
/// non-digit. A missing or malformed size (including an explicit 0)
/// yields `None`.
fn parse_metadata(payload: &[u8]) -> (String, Option<u32>) {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len().saturating_sub(1));
    let filename = String::from_utf8_lossy(&payload[..nul]).into_owned();

    let mut size: u32 = 0;
    for &b in &payload[(nul + 1).min(payload.len())..] {
        if b.is_ascii_digit() {
            size = size.wrapping_mul(10).wrapping_add(u32::from(b - b'0'));
        } else {
            break;
        }
    }

    (filename, (size > 0).then_some(size))
}
