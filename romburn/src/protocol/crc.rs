//! CRC16-XMODEM checksum calculation.
//!
//! The XMODEM/YMODEM CRC-16 uses the polynomial
//! x^16 + x^12 + x^5 + 1 (generator 0x1021), initial value 0, no
//! reflection and no final XOR. A transmitted block carries the CRC
//! big-endian after the payload, so recomputing over payload plus
//! trailer yields 0 for an intact block.
//!
//! Instead of a 256-entry table, two 16-entry tables are used, one
//! per nibble of the dividend byte. By linearity of the polynomial
//! division, the 256-entry value for byte `b` is
//! `NIBBLE_TABLE[b & 0xF] ^ NIBBLE_TABLE[(b >> 4) + 16]`.

/// Per-nibble remainder tables: entries 0..16 for the low nibble
/// (dividend `i << 8`), entries 16..32 for the high nibble
/// (dividend `i << 12`).
const NIBBLE_TABLE: [u16; 32] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x0000, 0x1231, 0x2462, 0x3653, 0x48c4, 0x5af5, 0x6ca6, 0x7e97,
    0x9188, 0x83b9, 0xb5ea, 0xa7db, 0xd94c, 0xcb7d, 0xfd2e, 0xef1f,
];

/// Compute the CRC16-XMODEM of a byte buffer.
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in data {
        let pos = (crc >> 8) as u8 ^ byte;
        crc = (crc << 8)
            ^ NIBBLE_TABLE[usize::from(pos & 0xF)]
            ^ NIBBLE_TABLE[usize::from(pos >> 4) + 16];
    }

    crc
}
