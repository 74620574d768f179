//! FAT32 on-disk structures
//!
//! Everything here works on 512-byte sectors already read from the card;
//! the I/O lives in [`super::card`] and [`super::stream`].

use bitflags::bitflags;

use crate::error::SdcError;

pub const BLOCK_SIZE: usize = 512;
pub const DIR_ENTRY_SIZE: usize = 32;
pub const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

const BOOT_SIGNATURE: u16 = 0xAA55;
const PARTITION_TABLE: usize = 0x1BE;
const PARTITION_ENTRY_SIZE: usize = 16;
const FAT32_PARTITION_TYPES: [u8; 2] = [0x0B, 0x0C];

const FAT_ENTRIES_PER_SECTOR: u32 = (BLOCK_SIZE / 4) as u32;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const FAT_BAD_CLUSTER: u32 = 0x0FFF_FFF7;
const FAT_END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// First cluster number of the data region
pub const FIRST_DATA_CLUSTER: u32 = 2;

pub type Sector = [u8; BLOCK_SIZE];

fn u16_at(sector: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([sector[offset], sector[offset + 1]])
}

fn u32_at(sector: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        sector[offset],
        sector[offset + 1],
        sector[offset + 2],
        sector[offset + 3],
    ])
}

/// 8.3 name as stored in a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName([u8; 11]);

impl ShortName {
    /// Normalize `name`: upper case, base and extension space-padded to 8
    /// and 3 bytes, longer parts truncated
    pub fn new(name: &str) -> Self {
        let (base, ext) = match name.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (base, ext),
            _ => (name, ""),
        };

        let mut raw = [b' '; 11];
        for (dst, src) in raw[..8].iter_mut().zip(base.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        for (dst, src) in raw[8..].iter_mut().zip(ext.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        Self(raw)
    }

    pub const fn from_raw(raw: [u8; 11]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }
}

bitflags! {
    /// Directory entry attribute byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

impl Attributes {
    /// Combination marking a long-file-name fragment
    pub const LONG_NAME: Self = Self::READ_ONLY
        .union(Self::HIDDEN)
        .union(Self::SYSTEM)
        .union(Self::VOLUME_ID);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryKind {
    /// File or directory with a short name
    Normal,
    LongFileName,
    /// Deleted entry
    Unused,
    /// This and all following entries are free
    EndOfDirectory,
    /// Volume label or an unexpected attribute combination
    Unknown,
}

/// Classify a 32-byte directory record
pub fn classify(record: &[u8]) -> EntryKind {
    match record[0] {
        0x00 => EntryKind::EndOfDirectory,
        0xE5 => EntryKind::Unused,
        _ => {
            let attributes = Attributes::from_bits_retain(record[11]);
            if attributes.contains(Attributes::LONG_NAME) {
                EntryKind::LongFileName
            } else if !attributes.contains(Attributes::VOLUME_ID) {
                EntryKind::Normal
            } else {
                EntryKind::Unknown
            }
        }
    }
}

/// Short-name directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    pub first_cluster: u32,
    pub size: u32,
}

impl DirEntry {
    /// Offset of the file size within a record
    pub const SIZE_OFFSET: usize = 0x1C;

    pub fn parse(record: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&record[..11]);
        let high = u16_at(record, 0x14) as u32;
        let low = u16_at(record, 0x1A) as u32;
        Self {
            name: ShortName(name),
            attributes: Attributes::from_bits_retain(record[11]),
            first_cluster: (high << 16) | low,
            size: u32_at(record, Self::SIZE_OFFSET),
        }
    }
}

/// Result of scanning one directory sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSearch {
    /// Entry found at record `index` of the sector
    Found { index: usize, entry: DirEntry },
    /// Not in this sector, keep scanning
    Continue,
    /// Hit the end-of-directory marker
    End,
}

/// Look for a file named `name` among the 16 records of `sector`
pub fn search_sector(sector: &Sector, name: &ShortName) -> DirSearch {
    for (index, record) in sector.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        match classify(record) {
            EntryKind::EndOfDirectory => return DirSearch::End,
            EntryKind::Normal => {
                let entry = DirEntry::parse(record);
                if entry.name == *name && !entry.attributes.contains(Attributes::DIRECTORY) {
                    return DirSearch::Found { index, entry };
                }
            }
            EntryKind::LongFileName | EntryKind::Unused | EntryKind::Unknown => {}
        }
    }
    DirSearch::Continue
}

/// Follow a FAT entry: `None` at end of chain
pub fn decode_fat_entry(raw: u32) -> Result<Option<u32>, SdcError> {
    match raw & FAT_ENTRY_MASK {
        next if next >= FAT_END_OF_CHAIN => Ok(None),
        FAT_BAD_CLUSTER | 0 | 1 => Err(SdcError::CorruptChain),
        next => Ok(Some(next)),
    }
}

fn has_boot_signature(sector: &Sector) -> bool {
    u16_at(sector, 0x1FE) == BOOT_SIGNATURE
}

/// Whether `sector` is a FAT32 boot sector rather than an MBR
fn is_fat32_boot_sector(sector: &Sector) -> bool {
    let jump = sector[0] == 0xEB || sector[0] == 0xE9;
    let fat16_size = u16_at(sector, 0x16);
    jump && fat16_size == 0 && u32_at(sector, 0x24) != 0 && sector[0x10] != 0
}

/// Find the first sector of the FAT32 volume, given the card's sector 0
///
/// Accepts both partitioned cards and superfloppies whose boot sector sits
/// at LBA 0.
pub fn volume_start(sector0: &Sector) -> Result<u32, SdcError> {
    if !has_boot_signature(sector0) {
        return Err(SdcError::NoFat32Volume);
    }
    if is_fat32_boot_sector(sector0) {
        return Ok(0);
    }

    (0..4)
        .map(|i| &sector0[PARTITION_TABLE + i * PARTITION_ENTRY_SIZE..][..PARTITION_ENTRY_SIZE])
        .find(|entry| FAT32_PARTITION_TYPES.contains(&entry[4]))
        .map(|entry| u32_at(entry, 8))
        .ok_or(SdcError::NoFat32Volume)
}

/// Geometry of a mounted FAT32 volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Volume {
    pub partition_lba: u32,
    pub fat_lba: u32,
    pub sectors_per_fat: u32,
    pub fat_count: u8,
    pub sectors_per_cluster: u8,
    /// LBA of cluster 2
    pub cluster_base_lba: u32,
    pub root_cluster: u32,
}

impl Volume {
    /// Parse the boot sector found at `partition_lba`
    pub fn from_boot_sector(partition_lba: u32, sector: &Sector) -> Result<Self, SdcError> {
        if !has_boot_signature(sector) || !is_fat32_boot_sector(sector) {
            return Err(SdcError::NoFat32Volume);
        }

        let bytes_per_sector = u16_at(sector, 0x0B);
        let sectors_per_cluster = sector[0x0D];
        let reserved = u16_at(sector, 0x0E) as u32;
        let fat_count = sector[0x10];
        let sectors_per_fat = u32_at(sector, 0x24);
        let root_cluster = u32_at(sector, 0x2C);

        if bytes_per_sector as usize != BLOCK_SIZE || !sectors_per_cluster.is_power_of_two() {
            return Err(SdcError::UnsupportedVolume);
        }

        let fat_lba = partition_lba
            .checked_add(reserved)
            .ok_or(SdcError::UnsupportedVolume)?;
        let cluster_base_lba = (fat_count as u32)
            .checked_mul(sectors_per_fat)
            .and_then(|fats| fats.checked_add(fat_lba))
            .ok_or(SdcError::UnsupportedVolume)?;
        // Every cluster the FAT can describe needs a 32-bit LBA
        sectors_per_fat
            .checked_mul(FAT_ENTRIES_PER_SECTOR)
            .and_then(|entries| entries.checked_sub(FIRST_DATA_CLUSTER))
            .and_then(|clusters| clusters.checked_mul(sectors_per_cluster as u32))
            .and_then(|sectors| sectors.checked_add(cluster_base_lba))
            .ok_or(SdcError::UnsupportedVolume)?;

        let volume = Self {
            partition_lba,
            fat_lba,
            sectors_per_fat,
            fat_count,
            sectors_per_cluster,
            cluster_base_lba,
            root_cluster,
        };
        if !volume.contains_cluster(root_cluster) {
            return Err(SdcError::UnsupportedVolume);
        }
        Ok(volume)
    }

    /// Number of entries in one copy of the FAT, reserved entries included
    pub fn fat_entries(&self) -> u32 {
        self.sectors_per_fat.saturating_mul(FAT_ENTRIES_PER_SECTOR)
    }

    /// Whether `cluster` is a data cluster with an entry in the FAT
    pub fn contains_cluster(&self, cluster: u32) -> bool {
        (FIRST_DATA_CLUSTER..self.fat_entries()).contains(&cluster)
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster as u32 * BLOCK_SIZE as u32
    }

    /// Bytes held by a chain of `clusters` clusters, saturating at the
    /// largest FAT32 file size
    pub fn chain_bytes(&self, clusters: u32) -> u32 {
        let bytes = clusters as u64 * self.cluster_bytes() as u64;
        bytes.min(u32::MAX as u64) as u32
    }

    /// First sector of `cluster`
    pub fn cluster_lba(&self, cluster: u32) -> Result<u32, SdcError> {
        if !self.contains_cluster(cluster) {
            return Err(SdcError::CorruptChain);
        }
        (cluster - FIRST_DATA_CLUSTER)
            .checked_mul(self.sectors_per_cluster as u32)
            .and_then(|offset| offset.checked_add(self.cluster_base_lba))
            .ok_or(SdcError::CorruptChain)
    }

    /// Sector and byte offset of the FAT entry for `cluster`
    pub fn fat_entry_location(&self, cluster: u32) -> (u32, usize) {
        (
            self.fat_lba + cluster / FAT_ENTRIES_PER_SECTOR,
            (cluster % FAT_ENTRIES_PER_SECTOR) as usize * 4,
        )
    }

    /// Read the FAT entry at `offset` of a FAT sector
    pub fn fat_entry(sector: &Sector, offset: usize) -> u32 {
        u32_at(sector, offset)
    }
}
