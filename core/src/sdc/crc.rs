//! CRC7 for command frames and CRC16-CCITT for data blocks

use crc::{Crc, CRC_16_XMODEM, CRC_7_MMC};

/// x^7 + x^3 + 1, as used by SD/MMC command frames
const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);

/// CRC16-CCITT (x^16 + x^12 + x^5 + 1) with a zero seed
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// 7-bit CRC of a command frame's first five bytes
pub fn crc7(data: &[u8]) -> u8 {
    CRC7.checksum(data)
}

/// 16-bit CRC of a data block
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
