//! SPI-mode command frames and response tokens

use bitflags::bitflags;

use super::crc::crc7;

/// Commands used by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// CMD0: software reset into SPI mode
    GoIdleState = 0,
    /// CMD1: initialization for MMC
    SendOpCond = 1,
    /// CMD8: voltage range and check pattern
    SendIfCond = 8,
    /// CMD13: R2 card status
    SendStatus = 13,
    /// CMD16: block length for byte-addressed cards
    SetBlockLen = 16,
    ReadSingleBlock = 17,
    WriteBlock = 24,
    /// ACMD41 (after CMD55): SD initialization
    SdSendOpCond = 41,
    /// CMD55: next command is an application command
    AppCmd = 55,
    ReadOcr = 58,
    CrcOnOff = 59,
}

impl Command {
    pub const fn index(self) -> u8 {
        self as u8
    }
}

/// CMD8 argument: 2.7-3.6 V supply and check pattern 0xAA
pub const IF_COND_ARG: u32 = 0x0000_01AA;

/// ACMD41 argument bit announcing host support for high capacity cards
pub const HCS: u32 = 1 << 30;

/// OCR bit set when the card addresses by block instead of byte
pub const OCR_CCS: u32 = 1 << 30;

/// Token preceding a data block in both directions
pub const DATA_START_TOKEN: u8 = 0xFE;

/// Build the 6-byte frame for `cmd` with `arg`
pub fn frame(cmd: Command, arg: u32) -> [u8; 6] {
    let [a0, a1, a2, a3] = arg.to_be_bytes();
    let mut frame = [0x40 | (cmd.index() & 0x3F), a0, a1, a2, a3, 0];
    frame[5] = (crc7(&frame[..5]) << 1) | 1;
    frame
}

bitflags! {
    /// R1 response byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1: u8 {
        const IDLE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const COM_CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// Bits that make a command fail
    pub const ERRORS: Self = Self::ILLEGAL_COMMAND
        .union(Self::COM_CRC_ERROR)
        .union(Self::ERASE_SEQUENCE_ERROR)
        .union(Self::ADDRESS_ERROR)
        .union(Self::PARAMETER_ERROR);

    pub fn is_error(self) -> bool {
        self.intersects(Self::ERRORS)
    }

    pub fn is_idle(self) -> bool {
        self.contains(Self::IDLE)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for R1 {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "R1({=u8:#04x})", self.bits())
    }
}

/// Status the card reports after receiving a written block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataResponse {
    Accepted,
    CrcError,
    WriteError,
}

impl DataResponse {
    /// Decode a `xxx0sss1` data-response token
    pub fn parse(token: u8) -> Option<Self> {
        match token & 0x1F {
            0x05 => Some(Self::Accepted),
            0x0B => Some(Self::CrcError),
            0x0D => Some(Self::WriteError),
            _ => None,
        }
    }
}
