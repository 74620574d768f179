//! SD card in SPI mode
//!
//! Initialization runs the SD version-detection sequence:
//!
//! ```text
//! 80 clocks ─▶ CMD0 ─▶ CMD8 ─┬─ R7 echoes 0x1AA ──▶ ACMD41(HCS) ─▶ CMD58 ─▶ SD v2 (byte/block)
//!                            ├─ no R7 ────────────▶ ACMD41 ──────────────▶ SD v1
//!                            │                        └─ rejected ─▶ CMD1 ▶ MMC
//!                            └─ R7 mismatch ──────▶ error
//! ```
//!
//! followed by CMD16 (byte-addressed cards only), CMD59 and mounting the
//! FAT32 volume.
//!
//! The SPI bus is shared: it sits behind an async mutex and is locked for
//! one command/response exchange at a time. The card itself is owned by the
//! [`super::Sdc`] handle, whose mutex is always taken before the bus mutex.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::Timer;
use embedded_hal::digital::OutputPin;
use embedded_hal_async::spi::SpiBus;

use super::command::{
    frame, Command, DataResponse, DATA_START_TOKEN, HCS, IF_COND_ARG, OCR_CCS, R1,
};
use super::crc::crc16;
use super::fat::{self, DirEntry, DirSearch, Sector, ShortName, Volume, BLOCK_SIZE, DIR_ENTRY_SIZE};
use super::retry::Recover;
use crate::config::SdcConfig;
use crate::error::SdcError;

/// Detected card type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardVersion {
    /// Not initialized
    Unknown,
    /// MultiMediaCard (CMD1 initialization)
    Mmc,
    /// SD version 1.x
    SdV1,
    /// SD version 2.0 or later, standard capacity
    SdV2ByteAddress,
    /// SD version 2.0 or later, high capacity
    SdV2BlockAddress,
}

impl CardVersion {
    pub fn is_block_addressed(self) -> bool {
        self == Self::SdV2BlockAddress
    }
}

/// Where a directory entry lives on the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedEntry {
    pub entry: DirEntry,
    pub lba: u32,
    pub offset: usize,
}

struct BlockCache {
    lba: Option<u32>,
    data: Sector,
}

fn bus_error<E>(_: E) -> SdcError {
    SdcError::Bus
}

/// An SD card on a shared SPI bus
pub struct SdCard<'b, M: RawMutex, BUS, CS> {
    spi: &'b Mutex<M, BUS>,
    cs: CS,
    config: SdcConfig,
    version: CardVersion,
    volume: Option<Volume>,
    cache: BlockCache,
}

impl<'b, M: RawMutex, BUS: SpiBus, CS: OutputPin> SdCard<'b, M, BUS, CS> {
    pub const fn new(spi: &'b Mutex<M, BUS>, cs: CS, config: SdcConfig) -> Self {
        Self {
            spi,
            cs,
            config,
            version: CardVersion::Unknown,
            volume: None,
            cache: BlockCache {
                lba: None,
                data: [0; BLOCK_SIZE],
            },
        }
    }

    pub fn version(&self) -> CardVersion {
        self.version
    }

    pub fn config(&self) -> &SdcConfig {
        &self.config
    }

    /// Geometry of the mounted volume
    pub fn volume(&self) -> Result<&Volume, SdcError> {
        self.volume.as_ref().ok_or(SdcError::NotInitialized)
    }

    /// Run the full initialization sequence and mount the FAT32 volume
    pub async fn init(&mut self) -> Result<CardVersion, SdcError> {
        self.version = CardVersion::Unknown;
        self.volume = None;
        self.cache.lba = None;

        self.power_up().await?;
        self.go_idle().await?;

        let version = match self.send_if_cond().await {
            Ok(()) => self.init_v2().await?,
            Err(SdcError::NoResponse | SdcError::Response(_)) => {
                info!("No R7 response, initializing as SD v1");
                self.init_v1().await?
            }
            Err(e) => {
                warn!("CMD8 failed: {:?}", e);
                return Err(e);
            }
        };

        if !version.is_block_addressed() {
            self.checked_command(Command::SetBlockLen, BLOCK_SIZE as u32)
                .await?;
        }
        self.set_crc(self.config.crc_enabled).await?;

        self.version = version;
        info!("SD card initialized: {:?}", version);

        self.mount().await?;
        Ok(version)
    }

    /// Re-run [`Self::init`] after a failure
    pub async fn reinitialize(&mut self) -> Result<CardVersion, SdcError> {
        warn!("Re-initializing SD card");
        self.init().await
    }

    /// Send one command and return its R1 response
    pub async fn command(&mut self, cmd: Command, arg: u32) -> Result<R1, SdcError> {
        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        let r1 = session.command(cmd, arg).await?;
        session.close().await?;
        Ok(r1)
    }

    /// Read the operating conditions register (CMD58)
    pub async fn read_ocr(&mut self) -> Result<u32, SdcError> {
        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        let (_, ocr) = session.command_r3r7(Command::ReadOcr, 0).await?;
        session.close().await?;
        Ok(ocr)
    }

    /// Turn CRC checking on the card on or off (CMD59)
    pub async fn set_crc(&mut self, enabled: bool) -> Result<(), SdcError> {
        self.checked_command(Command::CrcOnOff, enabled as u32).await?;
        self.config.crc_enabled = enabled;
        Ok(())
    }

    /// Read the R2 status (CMD13); `Ok` when the card reports no error,
    /// [`SdcError::CardStatus`] with the status byte otherwise
    pub async fn status(&mut self) -> Result<(), SdcError> {
        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        session.checked_command(Command::SendStatus, 0).await?;
        let status = session.read_byte().await?;
        session.close().await?;

        if status != 0 {
            warn!("Card status error: {:#x}", status);
            return Err(SdcError::CardStatus(status));
        }
        Ok(())
    }

    /// Read block `lba` through the block cache
    pub async fn read_block(&mut self, lba: u32) -> Result<&Sector, SdcError> {
        if self.cache.lba != Some(lba) {
            let address = self.block_address(lba)?;
            self.cache.lba = None;

            let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
            session
                .checked_command(Command::ReadSingleBlock, address)
                .await?;
            session.read_data(&mut self.cache.data).await?;
            session.close().await?;

            self.cache.lba = Some(lba);
        }
        Ok(&self.cache.data)
    }

    /// Read block `lba` into `out`
    pub async fn read_block_into(&mut self, lba: u32, out: &mut Sector) -> Result<(), SdcError> {
        out.copy_from_slice(self.read_block(lba).await?);
        Ok(())
    }

    /// Write block `lba` and confirm with a status read
    pub async fn write_block(&mut self, lba: u32, data: &Sector) -> Result<(), SdcError> {
        let address = self.block_address(lba)?;
        if self.cache.lba == Some(lba) {
            self.cache.lba = None;
        }

        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        session.checked_command(Command::WriteBlock, address).await?;
        session.write_data(data).await?;
        session.close().await?;

        // A failed program operation shows up in the status that follows it
        self.status().await.map_err(|e| match e {
            SdcError::CardStatus(_) => SdcError::WriteRejected,
            e => e,
        })?;

        self.cache.data.copy_from_slice(data);
        self.cache.lba = Some(lba);
        Ok(())
    }

    /// Next cluster of a chain, `None` at the end
    ///
    /// Fails with [`SdcError::CorruptChain`] when either cluster lies
    /// outside the FAT.
    pub async fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>, SdcError> {
        let volume = *self.volume()?;
        if !volume.contains_cluster(cluster) {
            return Err(SdcError::CorruptChain);
        }

        let (lba, offset) = volume.fat_entry_location(cluster);
        let sector = self.read_block(lba).await?;
        match fat::decode_fat_entry(Volume::fat_entry(sector, offset))? {
            Some(next) if !volume.contains_cluster(next) => {
                warn!("Cluster {} links to {}, past the FAT", cluster, next);
                Err(SdcError::CorruptChain)
            }
            next => Ok(next),
        }
    }

    /// Find a file in the root directory
    pub async fn find_in_root(&mut self, name: &ShortName) -> Result<LocatedEntry, SdcError> {
        let volume = *self.volume()?;
        let mut cluster = volume.root_cluster;

        loop {
            let first = volume.cluster_lba(cluster)?;
            for lba in first..first + volume.sectors_per_cluster as u32 {
                match fat::search_sector(self.read_block(lba).await?, name) {
                    DirSearch::Found { index, entry } => {
                        return Ok(LocatedEntry {
                            entry,
                            lba,
                            offset: index * DIR_ENTRY_SIZE,
                        })
                    }
                    DirSearch::End => return Err(SdcError::FileNotFound),
                    DirSearch::Continue => {}
                }
            }

            match self.next_cluster(cluster).await? {
                Some(next) => cluster = next,
                None => return Err(SdcError::FileNotFound),
            }
        }
    }

    async fn mount(&mut self) -> Result<(), SdcError> {
        let start = fat::volume_start(self.read_block(0).await?)?;
        let volume = Volume::from_boot_sector(start, self.read_block(start).await?)?;
        info!(
            "FAT32 volume at LBA {}: FAT at {}, clusters at {}, {} sectors per cluster",
            volume.partition_lba,
            volume.fat_lba,
            volume.cluster_base_lba,
            volume.sectors_per_cluster
        );
        self.volume = Some(volume);
        Ok(())
    }

    fn block_address(&self, lba: u32) -> Result<u32, SdcError> {
        match self.version {
            CardVersion::Unknown => Err(SdcError::NotInitialized),
            version if version.is_block_addressed() => Ok(lba),
            _ => lba
                .checked_mul(BLOCK_SIZE as u32)
                .ok_or(SdcError::Response(R1::ADDRESS_ERROR)),
        }
    }

    async fn power_up(&mut self) -> Result<(), SdcError> {
        self.cs.set_high().map_err(|_| SdcError::ChipSelect)?;
        // At least 74 clocks with CS high put the card into native mode
        let mut bus = self.spi.lock().await;
        bus.write(&[0xFF; 10]).await.map_err(bus_error)
    }

    async fn go_idle(&mut self) -> Result<(), SdcError> {
        for _ in 0..self.config.init_attempts {
            match self.command(Command::GoIdleState, 0).await {
                Ok(r1) if r1 == R1::IDLE => return Ok(()),
                Ok(_) | Err(SdcError::NoResponse) => {}
                Err(e) => return Err(e),
            }
            Timer::after(self.config.init_poll_interval).await;
        }
        warn!("Card did not enter idle state");
        Err(SdcError::InitFailed)
    }

    async fn send_if_cond(&mut self) -> Result<(), SdcError> {
        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        let (_, echo) = session.command_r3r7(Command::SendIfCond, IF_COND_ARG).await?;
        session.close().await?;

        if echo & 0xFFF != IF_COND_ARG {
            warn!("CMD8 echo mismatch: {}", echo);
            return Err(SdcError::InterfaceMismatch);
        }
        Ok(())
    }

    async fn init_v2(&mut self) -> Result<CardVersion, SdcError> {
        self.wait_ready(Command::SdSendOpCond, HCS).await?;
        let ocr = self.read_ocr().await?;
        Ok(if ocr & OCR_CCS != 0 {
            CardVersion::SdV2BlockAddress
        } else {
            CardVersion::SdV2ByteAddress
        })
    }

    async fn init_v1(&mut self) -> Result<CardVersion, SdcError> {
        match self.wait_ready(Command::SdSendOpCond, 0).await {
            Ok(()) => Ok(CardVersion::SdV1),
            Err(e @ (SdcError::Bus | SdcError::ChipSelect)) => Err(e),
            Err(e) => {
                info!("ACMD41 failed ({:?}), initializing as MMC", e);
                self.wait_ready(Command::SendOpCond, 0).await?;
                Ok(CardVersion::Mmc)
            }
        }
    }

    /// Repeat an operating-condition command until the card leaves idle
    async fn wait_ready(&mut self, cmd: Command, arg: u32) -> Result<(), SdcError> {
        for _ in 0..self.config.init_attempts {
            let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
            if cmd == Command::SdSendOpCond {
                session.checked_command(Command::AppCmd, 0).await?;
            }
            let r1 = session.checked_command(cmd, arg).await?;
            session.close().await?;

            if !r1.is_idle() {
                return Ok(());
            }
            Timer::after(self.config.init_poll_interval).await;
        }
        warn!("Card stayed idle after {:?}", cmd);
        Err(SdcError::InitFailed)
    }

    async fn checked_command(&mut self, cmd: Command, arg: u32) -> Result<R1, SdcError> {
        let mut session = Session::open(self.spi, &mut self.cs, &self.config).await?;
        let r1 = session.checked_command(cmd, arg).await?;
        session.close().await?;
        Ok(r1)
    }
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> Recover for SdCard<'_, M, BUS, CS> {
    async fn recover(&mut self) -> Result<(), SdcError> {
        self.reinitialize().await.map(|_| ())
    }
}

/// Bus locked and card selected; dropping deselects the card
struct Session<'s, M: RawMutex, BUS: SpiBus, CS: OutputPin> {
    bus: MutexGuard<'s, M, BUS>,
    cs: &'s mut CS,
    config: &'s SdcConfig,
}

impl<'s, M: RawMutex, BUS: SpiBus, CS: OutputPin> Session<'s, M, BUS, CS> {
    async fn open(
        spi: &'s Mutex<M, BUS>,
        cs: &'s mut CS,
        config: &'s SdcConfig,
    ) -> Result<Self, SdcError> {
        let bus = spi.lock().await;
        cs.set_low().map_err(|_| SdcError::ChipSelect)?;
        Ok(Self { bus, cs, config })
    }

    /// Deselect the card and give it eight clocks to release MISO
    async fn close(mut self) -> Result<(), SdcError> {
        self.cs.set_high().map_err(|_| SdcError::ChipSelect)?;
        self.bus.write(&[0xFF]).await.map_err(bus_error)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<(), SdcError> {
        buf.fill(0xFF);
        self.bus.transfer_in_place(buf).await.map_err(bus_error)
    }

    async fn read_byte(&mut self) -> Result<u8, SdcError> {
        let mut byte = [0xFF];
        self.read(&mut byte).await?;
        Ok(byte[0])
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SdcError> {
        self.bus.write(bytes).await.map_err(bus_error)
    }

    /// R1 is the first byte that is not 0xFF
    async fn r1(&mut self) -> Result<R1, SdcError> {
        for _ in 0..self.config.response_poll_bytes {
            let byte = self.read_byte().await?;
            if byte != 0xFF {
                return Ok(R1::from_bits_retain(byte));
            }
        }
        Err(SdcError::NoResponse)
    }

    async fn command(&mut self, cmd: Command, arg: u32) -> Result<R1, SdcError> {
        self.write(&frame(cmd, arg)).await?;
        self.r1().await
    }

    async fn checked_command(&mut self, cmd: Command, arg: u32) -> Result<R1, SdcError> {
        let r1 = self.command(cmd, arg).await?;
        if r1.is_error() {
            debug!("{:?} failed: {:?}", cmd, r1);
            return Err(SdcError::Response(r1));
        }
        Ok(r1)
    }

    /// Command with an R3 or R7 response; the trailing word is only read
    /// when R1 reports no error
    async fn command_r3r7(&mut self, cmd: Command, arg: u32) -> Result<(R1, u32), SdcError> {
        let r1 = self.checked_command(cmd, arg).await?;
        let mut word = [0u8; 4];
        self.read(&mut word).await?;
        Ok((r1, u32::from_be_bytes(word)))
    }

    async fn read_data(&mut self, out: &mut Sector) -> Result<(), SdcError> {
        self.wait_data_token().await?;
        self.read(out).await?;
        let mut crc = [0u8; 2];
        self.read(&mut crc).await?;

        if self.config.crc_enabled && u16::from_be_bytes(crc) != crc16(out) {
            return Err(SdcError::DataCrc);
        }
        Ok(())
    }

    async fn wait_data_token(&mut self) -> Result<(), SdcError> {
        for _ in 0..self.config.data_token_poll_bytes {
            match self.read_byte().await? {
                DATA_START_TOKEN => return Ok(()),
                0xFF => {}
                token => {
                    debug!("Data error token {}", token);
                    return Err(SdcError::NoDataToken);
                }
            }
        }
        Err(SdcError::NoDataToken)
    }

    async fn write_data(&mut self, data: &Sector) -> Result<(), SdcError> {
        self.write(&[0xFF, DATA_START_TOKEN]).await?;
        self.write(data).await?;
        self.write(&crc16(data).to_be_bytes()).await?;

        let mut token = None;
        for _ in 0..self.config.response_poll_bytes {
            let byte = self.read_byte().await?;
            if byte != 0xFF {
                token = Some(byte);
                break;
            }
        }

        match token.and_then(DataResponse::parse) {
            Some(DataResponse::Accepted) => self.wait_not_busy().await,
            Some(DataResponse::CrcError) => Err(SdcError::WriteCrcRejected),
            Some(DataResponse::WriteError) => Err(SdcError::WriteRejected),
            None => Err(SdcError::NoResponse),
        }
    }

    /// The card holds MISO low while programming
    async fn wait_not_busy(&mut self) -> Result<(), SdcError> {
        for _ in 0..self.config.busy_poll_bytes {
            if self.read_byte().await? == 0xFF {
                return Ok(());
            }
        }
        Err(SdcError::Busy)
    }
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> Drop for Session<'_, M, BUS, CS> {
    fn drop(&mut self) {
        let _ = self.cs.set_high();
    }
}
