use core::convert::Infallible;
use std::collections::VecDeque;
use std::vec;
use std::vec::Vec;

use embedded_hal_async::spi::{ErrorType, SpiBus};

use crate::sdc::command::{Command, R1};
use crate::sdc::crc::{crc16, crc7};
use crate::sdc::fat::{Sector, ShortName, BLOCK_SIZE, DIR_ENTRY_SIZE};

const RESERVED_SECTORS: u32 = 4;
const FAT_COUNT: u32 = 2;
const SECTORS_PER_FAT: u32 = 1;
const DATA_CLUSTERS: u32 = 120;
const END_OF_CHAIN: u32 = 0x0FFF_FFFF;
const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// In-memory FAT32 volume
///
/// The root directory starts at cluster 2 and already holds a volume label,
/// a deleted entry and a long-name fragment ahead of any added file. File
/// clusters are chained with gaps so readers have to follow the FAT.
pub struct FatImage {
    data: Vec<u8>,
    partition_lba: u32,
    sectors_per_cluster: u32,
    next_cluster: u32,
    root_clusters: Vec<u32>,
    root_entries: usize,
}

impl FatImage {
    pub const PARTITION_LBA: u32 = 8;

    /// MBR with one FAT32 (LBA) partition, one sector per cluster
    pub fn partitioned() -> Self {
        Self::build(Self::PARTITION_LBA, 1)
    }

    /// Partitioned volume with `sectors_per_cluster` sectors per cluster
    pub fn partitioned_with_clusters_of(sectors_per_cluster: u8) -> Self {
        Self::build(Self::PARTITION_LBA, sectors_per_cluster)
    }

    /// Boot sector at LBA 0, no partition table
    pub fn superfloppy() -> Self {
        Self::build(0, 1)
    }

    fn build(partition_lba: u32, sectors_per_cluster: u8) -> Self {
        let volume_sectors = RESERVED_SECTORS
            + FAT_COUNT * SECTORS_PER_FAT
            + DATA_CLUSTERS * sectors_per_cluster as u32;
        let total = partition_lba + volume_sectors;
        let mut image = Self {
            data: vec![0; total as usize * BLOCK_SIZE],
            partition_lba,
            sectors_per_cluster: sectors_per_cluster as u32,
            next_cluster: 3,
            root_clusters: vec![2],
            root_entries: 0,
        };

        if partition_lba != 0 {
            let entry = 0x1BE;
            image.data[entry + 4] = 0x0C;
            image.put_u32(entry + 8, partition_lba);
            image.put_u32(entry + 12, volume_sectors);
            image.put_u16(0x1FE, 0xAA55);
        }

        let boot = partition_lba as usize * BLOCK_SIZE;
        image.data[boot..boot + 3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        image.data[boot + 3..boot + 11].copy_from_slice(b"MSWIN4.1");
        image.put_u16(boot + 0x0B, BLOCK_SIZE as u16);
        image.data[boot + 0x0D] = sectors_per_cluster;
        image.put_u16(boot + 0x0E, RESERVED_SECTORS as u16);
        image.data[boot + 0x10] = FAT_COUNT as u8;
        image.data[boot + 0x15] = 0xF8;
        image.put_u32(boot + 0x20, volume_sectors);
        image.put_u32(boot + 0x24, SECTORS_PER_FAT);
        image.put_u32(boot + 0x2C, 2);
        image.data[boot + 0x52..boot + 0x5A].copy_from_slice(b"FAT32   ");
        image.put_u16(boot + 0x1FE, 0xAA55);

        image.set_fat(0, 0x0FFF_FFF8);
        image.set_fat(1, END_OF_CHAIN);
        image.set_fat(2, END_OF_CHAIN);

        image.push_record(b"SDCARD     ", 0x08, 0, 0);
        image.push_record(b"\xE5LD     TXT", 0x20, 0, 0);
        image.push_record(b"Ad\0a\0t\0a\0.\0", 0x0F, 0, 0);
        image
    }

    /// Add a file to the root directory, allocating at least `clusters`
    /// clusters; returns its first cluster
    pub fn add_file(&mut self, name: &str, contents: &[u8], clusters: u32) -> u32 {
        let cluster_bytes = self.cluster_bytes();
        let needed = contents.len().div_ceil(cluster_bytes) as u32;
        let count = clusters.max(needed);

        let chain: Vec<u32> = (0..count).map(|i| self.next_cluster + 2 * i).collect();
        if let Some(last) = chain.last() {
            self.next_cluster = last + 1;
        }
        for pair in chain.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = chain.last() {
            self.set_fat(last, END_OF_CHAIN);
        }

        for (cluster, chunk) in chain.iter().zip(contents.chunks(cluster_bytes)) {
            let start = self.cluster_lba(*cluster) as usize * BLOCK_SIZE;
            self.data[start..start + chunk.len()].copy_from_slice(chunk);
        }

        let first = chain.first().copied().unwrap_or(0);
        self.push_record(
            ShortName::new(name).as_bytes(),
            0x20,
            first,
            contents.len() as u32,
        );
        first
    }

    pub fn sector(&self, lba: u32) -> Sector {
        let start = lba as usize * BLOCK_SIZE;
        let mut sector = [0u8; BLOCK_SIZE];
        sector.copy_from_slice(&self.data[start..start + BLOCK_SIZE]);
        sector
    }

    /// First sector of `cluster`
    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.partition_lba
            + RESERVED_SECTORS
            + FAT_COUNT * SECTORS_PER_FAT
            + (cluster - 2) * self.sectors_per_cluster
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * BLOCK_SIZE
    }

    /// Overwrite the entry for `cluster` in both FATs
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..FAT_COUNT {
            let fat = (self.partition_lba + RESERVED_SECTORS + copy * SECTORS_PER_FAT) as usize;
            self.put_u32(fat * BLOCK_SIZE + cluster as usize * 4, value);
        }
    }

    fn push_record(&mut self, name: &[u8; 11], attributes: u8, first_cluster: u32, size: u32) {
        let per_cluster = ENTRIES_PER_SECTOR * self.sectors_per_cluster as usize;
        if self.root_entries == self.root_clusters.len() * per_cluster {
            let cluster = self.next_cluster;
            self.next_cluster += 1;
            if let Some(&last) = self.root_clusters.last() {
                self.set_fat(last, cluster);
            }
            self.set_fat(cluster, END_OF_CHAIN);
            self.root_clusters.push(cluster);
        }

        let cluster = self.root_clusters[self.root_entries / per_cluster];
        let record = self.cluster_lba(cluster) as usize * BLOCK_SIZE
            + (self.root_entries % per_cluster) * DIR_ENTRY_SIZE;
        self.root_entries += 1;

        self.data[record..record + 11].copy_from_slice(name);
        self.data[record + 11] = attributes;
        self.put_u16(record + 0x14, (first_cluster >> 16) as u16);
        self.put_u16(record + 0x1A, first_cluster as u16);
        self.put_u32(record + 0x1C, size);
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Card type the emulator pretends to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatedCard {
    /// SDHC: block addressing
    HighCapacity,
    /// SD v2 with byte addressing
    StandardCapacity,
    /// SD v1: rejects CMD8
    V1,
    /// MMC: rejects CMD8 and ACMD41
    Mmc,
    /// Answers CMD8 with a wrong check pattern
    BadInterface,
}

enum State {
    Command(Vec<u8>),
    AwaitDataToken { lba: u32 },
    ReceiveData { lba: u32, data: Vec<u8> },
}

/// SD card in SPI mode, byte by byte
///
/// Every clocked byte shifts one queued response byte out and feeds the
/// host's byte to the command parser. Chip select is not observed.
pub struct SdCardEmulator {
    image: Vec<u8>,
    kind: EmulatedCard,
    state: State,
    out: VecDeque<u8>,
    idle: bool,
    app_command: bool,
    crc_enabled: bool,
    /// Operating-condition polls answered with "still idle"
    init_polls: u32,
    polls_left: u32,
    corrupt_reads: u32,
    /// Second byte of every R2 response
    status: u8,
    commands: Vec<u8>,
}

impl SdCardEmulator {
    pub fn new(image: FatImage) -> Self {
        Self {
            image: image.data,
            kind: EmulatedCard::HighCapacity,
            state: State::Command(Vec::new()),
            out: VecDeque::new(),
            idle: true,
            app_command: false,
            crc_enabled: false,
            init_polls: 2,
            polls_left: 2,
            corrupt_reads: 0,
            status: 0,
            commands: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: EmulatedCard) -> Self {
        self.kind = kind;
        self
    }

    /// Send a wrong CRC with the next `count` read blocks
    pub fn corrupt_next_reads(&mut self, count: u32) {
        self.corrupt_reads = count;
    }

    /// Report `status` in the R2 response to CMD13
    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    /// Number of times `cmd` was received
    pub fn count(&self, cmd: Command) -> usize {
        self.commands.iter().filter(|&&c| c == cmd.index()).count()
    }

    pub fn crc_enabled(&self) -> bool {
        self.crc_enabled
    }

    pub fn sector(&self, lba: u32) -> Sector {
        let start = lba as usize * BLOCK_SIZE;
        let mut sector = [0u8; BLOCK_SIZE];
        sector.copy_from_slice(&self.image[start..start + BLOCK_SIZE]);
        sector
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        let miso = self.out.pop_front().unwrap_or(0xFF);
        self.receive(mosi);
        miso
    }

    fn receive(&mut self, byte: u8) {
        match &mut self.state {
            State::Command(frame) => {
                if frame.is_empty() && byte & 0xC0 != 0x40 {
                    return;
                }
                frame.push(byte);
                if frame.len() == 6 {
                    let frame = core::mem::take(frame);
                    self.execute(&frame);
                }
            }
            State::AwaitDataToken { lba } => {
                if byte == 0xFE {
                    let lba = *lba;
                    self.state = State::ReceiveData {
                        lba,
                        data: Vec::new(),
                    };
                }
            }
            State::ReceiveData { lba, data } => {
                data.push(byte);
                if data.len() == BLOCK_SIZE + 2 {
                    let lba = *lba;
                    let data = core::mem::take(data);
                    self.state = State::Command(Vec::new());
                    self.finish_write(lba, &data);
                }
            }
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One byte of command response time
        self.out.push_back(0xFF);
        self.out.extend(bytes);
    }

    fn r1(&self) -> u8 {
        if self.idle {
            R1::IDLE.bits()
        } else {
            0
        }
    }

    fn lba(&self, arg: u32) -> u32 {
        match self.kind {
            EmulatedCard::HighCapacity => arg,
            _ => arg / BLOCK_SIZE as u32,
        }
    }

    fn in_range(&self, lba: u32) -> bool {
        (lba as usize + 1) * BLOCK_SIZE <= self.image.len()
    }

    fn execute(&mut self, frame: &[u8]) {
        self.out.clear();
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(index);

        let crc_valid = (crc7(&frame[..5]) << 1) | 1 == frame[5];
        let crc_checked = self.crc_enabled || index == 0 || index == 8;
        if crc_checked && !crc_valid {
            self.app_command = false;
            self.respond(&[self.r1() | R1::COM_CRC_ERROR.bits()]);
            return;
        }

        let app = core::mem::take(&mut self.app_command);
        let illegal = self.r1() | R1::ILLEGAL_COMMAND.bits();

        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.crc_enabled = false;
                self.polls_left = self.init_polls;
                self.state = State::Command(Vec::new());
                self.respond(&[R1::IDLE.bits()]);
            }
            (false, 8) => match self.kind {
                EmulatedCard::V1 | EmulatedCard::Mmc => self.respond(&[illegal]),
                EmulatedCard::BadInterface => self.respond(&[self.r1(), 0, 0, 0x01, 0x55]),
                _ => {
                    let [_, _, voltage, pattern] = arg.to_be_bytes();
                    self.respond(&[self.r1(), 0, 0, voltage & 0x0F, pattern]);
                }
            },
            (false, 55) => {
                self.app_command = true;
                self.respond(&[self.r1()]);
            }
            (true, 41) if self.kind == EmulatedCard::Mmc => self.respond(&[illegal]),
            (true, 41) | (false, 1) => {
                if self.polls_left > 0 {
                    self.polls_left -= 1;
                } else {
                    self.idle = false;
                }
                self.respond(&[self.r1()]);
            }
            (false, 58) => {
                let mut ocr = 0x00FF_8000u32;
                if !self.idle {
                    ocr |= 1 << 31;
                    if self.kind == EmulatedCard::HighCapacity {
                        ocr |= 1 << 30;
                    }
                }
                let [a, b, c, d] = ocr.to_be_bytes();
                self.respond(&[self.r1(), a, b, c, d]);
            }
            (false, 59) => {
                self.crc_enabled = arg & 1 != 0;
                self.respond(&[self.r1()]);
            }
            (false, 16) => {
                if arg == BLOCK_SIZE as u32 {
                    self.respond(&[self.r1()]);
                } else {
                    self.respond(&[self.r1() | R1::PARAMETER_ERROR.bits()]);
                }
            }
            (false, 13) => self.respond(&[self.r1(), self.status]),
            (false, 17) => {
                let lba = self.lba(arg);
                if self.idle {
                    self.respond(&[illegal]);
                } else if !self.in_range(lba) {
                    self.respond(&[R1::ADDRESS_ERROR.bits()]);
                } else {
                    let block = self.sector(lba);
                    let mut crc = crc16(&block);
                    if self.corrupt_reads > 0 {
                        self.corrupt_reads -= 1;
                        crc ^= 0xFFFF;
                    }
                    self.respond(&[0x00, 0xFF, 0xFF, 0xFE]);
                    self.out.extend(block);
                    self.out.extend(crc.to_be_bytes());
                }
            }
            (false, 24) => {
                let lba = self.lba(arg);
                if self.idle {
                    self.respond(&[illegal]);
                } else if !self.in_range(lba) {
                    self.respond(&[R1::ADDRESS_ERROR.bits()]);
                } else {
                    self.state = State::AwaitDataToken { lba };
                    self.respond(&[0x00]);
                }
            }
            _ => self.respond(&[illegal]),
        }
    }

    fn finish_write(&mut self, lba: u32, data: &[u8]) {
        let (block, crc) = data.split_at(BLOCK_SIZE);
        if self.crc_enabled && crc16(block).to_be_bytes() != crc {
            self.out.push_back(0xEB);
            return;
        }

        let start = lba as usize * BLOCK_SIZE;
        self.image[start..start + BLOCK_SIZE].copy_from_slice(block);
        // Accepted, then busy while programming
        self.out.extend([0xE5, 0x00, 0x00, 0x00]);
    }
}

impl ErrorType for SdCardEmulator {
    type Error = Infallible;
}

impl SpiBus for SdCardEmulator {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        for word in words {
            *word = self.exchange(0xFF);
        }
        Ok(())
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        for &word in words {
            self.exchange(word);
        }
        Ok(())
    }

    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        let len = read.len().max(write.len());
        for i in 0..len {
            let miso = self.exchange(write.get(i).copied().unwrap_or(0xFF));
            if let Some(word) = read.get_mut(i) {
                *word = miso;
            }
        }
        Ok(())
    }

    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        for word in words {
            *word = self.exchange(*word);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}
