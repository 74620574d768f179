//! Error types for the core subsystems

use crate::sdc::command::R1;

/// A fixed-capacity container is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CapacityExceeded;

impl core::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Capacity exceeded")
    }
}

impl core::error::Error for CapacityExceeded {}

/// Delay scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerError {
    /// The deadline heap has no room for another pending delay
    CapacityExceeded,
    /// The handle is already waiting on a delay
    HandleBusy,
}

impl From<CapacityExceeded> for SchedulerError {
    fn from(_: CapacityExceeded) -> Self {
        Self::CapacityExceeded
    }
}

impl core::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "Too many pending delays"),
            Self::HandleBusy => write!(f, "Delay handle already in use"),
        }
    }
}

impl core::error::Error for SchedulerError {}

/// DMA channel pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaError {
    /// No channel could be locked before the timeout elapsed
    Timeout,
    /// The requested (unit, channel) pair is not part of the pool
    UnknownChannel,
}

impl core::fmt::Display for DmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "DMA channel lock timeout"),
            Self::UnknownChannel => write!(f, "Unknown DMA channel"),
        }
    }
}

impl core::error::Error for DmaError {}

/// SD card and FAT32 errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdcError {
    /// SPI bus transfer failed
    Bus,
    /// Chip-select pin could not be driven
    ChipSelect,
    /// Operation did not complete before its deadline
    Timeout,
    /// No R1 response within the polling window
    NoResponse,
    /// R1 response carried error bits
    Response(R1),
    /// CMD8 echoed a different check pattern or voltage range
    InterfaceMismatch,
    /// Card never left the idle state during initialization
    InitFailed,
    /// No data-start token before a block
    NoDataToken,
    /// CRC16 of a received block does not match
    DataCrc,
    /// The card rejected written data because of a CRC error
    WriteCrcRejected,
    /// The card reported a write error for written data
    WriteRejected,
    /// CMD13 returned a non-zero R2 status byte
    CardStatus(u8),
    /// The card did not release its busy signal
    Busy,
    /// Card has not been initialized
    NotInitialized,
    /// Neither an MBR with a FAT32 partition nor a FAT32 boot sector found
    NoFat32Volume,
    /// The FAT32 boot sector has unsupported geometry
    UnsupportedVolume,
    /// The file does not exist in the root directory
    FileNotFound,
    /// A cluster chain points at a free or reserved cluster
    CorruptChain,
    /// Access past the clusters allocated to the file
    EndOfFile,
    /// `seek_reader_prev_line` without a remembered line
    NoPreviousLine,
    /// Seek before the start or past the allocated end of a file
    InvalidSeek,
}

impl core::fmt::Display for SdcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bus => write!(f, "SPI bus error"),
            Self::ChipSelect => write!(f, "Chip select error"),
            Self::Timeout => write!(f, "Operation timeout"),
            Self::NoResponse => write!(f, "No response from card"),
            Self::Response(r1) => write!(f, "Card reported error (R1 = {:#04x})", r1.bits()),
            Self::InterfaceMismatch => write!(f, "Interface condition mismatch"),
            Self::InitFailed => write!(f, "Card initialization failed"),
            Self::NoDataToken => write!(f, "Missing data token"),
            Self::DataCrc => write!(f, "Data CRC mismatch"),
            Self::WriteCrcRejected => write!(f, "Write rejected: CRC error"),
            Self::WriteRejected => write!(f, "Write rejected: write error"),
            Self::CardStatus(status) => write!(f, "Card status error (R2 = {:#04x})", status),
            Self::Busy => write!(f, "Card busy"),
            Self::NotInitialized => write!(f, "Card not initialized"),
            Self::NoFat32Volume => write!(f, "No FAT32 volume"),
            Self::UnsupportedVolume => write!(f, "Unsupported FAT32 geometry"),
            Self::FileNotFound => write!(f, "File not found"),
            Self::CorruptChain => write!(f, "Corrupt cluster chain"),
            Self::EndOfFile => write!(f, "End of file"),
            Self::NoPreviousLine => write!(f, "No previous line"),
            Self::InvalidSeek => write!(f, "Seek out of range"),
        }
    }
}

impl core::error::Error for SdcError {}

impl embedded_io::Error for SdcError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Self::Timeout | Self::Busy => embedded_io::ErrorKind::TimedOut,
            Self::FileNotFound => embedded_io::ErrorKind::NotFound,
            Self::DataCrc | Self::CorruptChain | Self::UnsupportedVolume => {
                embedded_io::ErrorKind::InvalidData
            }
            Self::NoPreviousLine | Self::InvalidSeek => embedded_io::ErrorKind::InvalidInput,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}
