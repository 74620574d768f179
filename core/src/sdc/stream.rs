//! Card handle and buffered file streams
//!
//! [`Sdc`] owns the card behind a mutex. Streams opened through it keep their
//! own 512-byte buffer and lock the card only for the duration of a call.
//!
//! A stream locates the sector behind a byte offset by walking the cluster
//! chain from the file's first cluster every time the offset leaves the
//! buffered sector, so backward seeks over long files are expensive.
//!
//! Files cannot grow beyond the clusters allocated to them when they were
//! created.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embedded_hal::digital::OutputPin;
use embedded_hal_async::spi::SpiBus;
use embedded_io_async::SeekFrom;

use super::card::{CardVersion, SdCard};
use super::fat::{DirEntry, Sector, ShortName, BLOCK_SIZE, FIRST_DATA_CLUSTER};
use super::retry::keep_trying;
use crate::config::{RetryPolicy, SdcConfig};
use crate::error::SdcError;

/// Shared handle to one SD card
pub struct Sdc<'b, M: RawMutex, BUS, CS> {
    card: Mutex<M, SdCard<'b, M, BUS, CS>>,
    initialized: AtomicBool,
    ready: Signal<M, ()>,
}

impl<'b, M: RawMutex, BUS: SpiBus, CS: OutputPin> Sdc<'b, M, BUS, CS> {
    pub const fn new(spi: &'b Mutex<M, BUS>, cs: CS, config: SdcConfig) -> Self {
        Self {
            card: Mutex::new(SdCard::new(spi, cs, config)),
            initialized: AtomicBool::new(false),
            ready: Signal::new(),
        }
    }

    /// Initialize the card and mount its volume, retrying per the
    /// configured policy
    pub async fn init(&self) -> Result<CardVersion, SdcError> {
        let mut card = self.card.lock().await;
        let policy = card.config().retry;
        let version = keep_trying(&mut *card, &policy, async |card| card.init().await).await?;

        self.initialized.store(true, Ordering::Release);
        self.ready.signal(());
        Ok(version)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Wait until the first [`Self::init`] has succeeded
    pub async fn wait_initialized(&self) {
        while !self.is_initialized() {
            self.ready.wait().await;
        }
        // Pass the wake-up on to the next waiter
        self.ready.signal(());
    }

    /// Read one block with retries
    pub async fn read_block(&self, lba: u32, out: &mut Sector) -> Result<(), SdcError> {
        let mut card = self.lock_initialized().await?;
        let policy = card.config().retry;
        keep_trying(&mut *card, &policy, async |card| {
            card.read_block_into(lba, &mut *out).await
        })
        .await
    }

    /// Write one block with retries
    pub async fn write_block(&self, lba: u32, data: &Sector) -> Result<(), SdcError> {
        let mut card = self.lock_initialized().await?;
        let policy = card.config().retry;
        keep_trying(&mut *card, &policy, async |card| card.write_block(lba, data).await).await
    }

    /// Open an existing file in the root directory
    pub async fn open_stream(&self, name: &str) -> Result<SdcStream<'_, 'b, M, BUS, CS>, SdcError> {
        let name = ShortName::new(name);
        let mut card = self.lock_initialized().await?;
        let policy = card.config().retry;

        let located = keep_trying(&mut *card, &policy, async |card| {
            card.find_in_root(&name).await
        })
        .await?;
        let entry = located.entry;

        let volume = *card.volume()?;
        let clusters = count_clusters(&mut card, &policy, &entry).await?;
        let allocated = volume.chain_bytes(clusters);
        if entry.size > allocated {
            warn!("File size {} exceeds {} allocated bytes", entry.size, allocated);
            return Err(SdcError::CorruptChain);
        }

        let start_lba = if entry.first_cluster >= FIRST_DATA_CLUSTER {
            volume.cluster_lba(entry.first_cluster)?
        } else {
            0
        };
        debug!(
            "Opened stream: cluster {}, {} of {} bytes",
            entry.first_cluster, entry.size, allocated
        );

        Ok(SdcStream {
            sdc: self,
            policy,
            first_cluster: entry.first_cluster,
            start_lba,
            entry_lba: located.lba,
            entry_offset: located.offset,
            size: entry.size,
            saved_size: entry.size,
            allocated,
            cursor: 0,
            prev_line: None,
            buffer: [0; BLOCK_SIZE],
            buffer_lba: None,
            dirty: false,
        })
    }

    async fn lock_initialized(&self) -> Result<MutexGuard<'_, M, SdCard<'b, M, BUS, CS>>, SdcError> {
        if !self.is_initialized() {
            return Err(SdcError::NotInitialized);
        }
        Ok(self.card.lock().await)
    }
}

async fn count_clusters<M: RawMutex, BUS: SpiBus, CS: OutputPin>(
    card: &mut SdCard<'_, M, BUS, CS>,
    policy: &RetryPolicy,
    entry: &DirEntry,
) -> Result<u32, SdcError> {
    if entry.first_cluster < FIRST_DATA_CLUSTER {
        return Ok(0);
    }

    let volume = *card.volume()?;
    // A longer chain visits some cluster twice
    let limit = volume.fat_entries().saturating_sub(FIRST_DATA_CLUSTER);
    let mut cluster = entry.first_cluster;
    let mut count = 1;
    while let Some(next) =
        keep_trying(card, policy, async |card| card.next_cluster(cluster).await).await?
    {
        count += 1;
        if count > limit {
            return Err(SdcError::CorruptChain);
        }
        cluster = next;
    }
    Ok(count)
}

/// How [`SdcStream::get_next_line`] stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineEnd {
    /// Consumed a newline
    Newline,
    /// Reached the end of the file without a newline
    EndOfFile,
    /// The output buffer filled up first; the rest of the line is unread
    Truncated,
}

/// A line copied out by [`SdcStream::get_next_line`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Line {
    /// Bytes written to the output buffer, line terminator excluded
    pub len: usize,
    pub end: LineEnd,
}

/// Buffered random-access stream over one file
///
/// Writes stay in the stream's buffer until the cursor leaves the buffered
/// sector or [`Self::flush`] is called. [`Self::save`] also stores a changed
/// file size in the directory entry.
pub struct SdcStream<'s, 'b, M: RawMutex, BUS, CS> {
    sdc: &'s Sdc<'b, M, BUS, CS>,
    policy: RetryPolicy,
    first_cluster: u32,
    start_lba: u32,
    entry_lba: u32,
    entry_offset: usize,
    size: u32,
    saved_size: u32,
    allocated: u32,
    cursor: u32,
    prev_line: Option<u32>,
    buffer: Sector,
    buffer_lba: Option<u32>,
    dirty: bool,
}

impl<'s, 'b, M: RawMutex, BUS: SpiBus, CS: OutputPin> SdcStream<'s, 'b, M, BUS, CS> {
    /// File size in bytes
    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes the file can hold without allocating clusters
    pub fn capacity(&self) -> u32 {
        self.allocated
    }

    pub fn position(&self) -> u32 {
        self.cursor
    }

    /// Read up to `out.len()` bytes at the cursor; `Ok(0)` at end of file
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, SdcError> {
        let sdc = self.sdc;
        let mut card = sdc.card.lock().await;

        let len = out.len().min(self.size.saturating_sub(self.cursor) as usize);
        let mut done = 0;
        while done < len {
            self.load(&mut card, self.cursor).await?;
            let offset = self.cursor as usize % BLOCK_SIZE;
            let n = (len - done).min(BLOCK_SIZE - offset);
            out[done..done + n].copy_from_slice(&self.buffer[offset..offset + n]);
            done += n;
            self.cursor += n as u32;
        }
        Ok(len)
    }

    /// Write at the cursor, extending the file within its allocation
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, SdcError> {
        if data.is_empty() {
            return Ok(0);
        }
        let room = self.allocated.saturating_sub(self.cursor) as usize;
        if room == 0 {
            return Err(SdcError::EndOfFile);
        }

        let sdc = self.sdc;
        let mut card = sdc.card.lock().await;

        let len = data.len().min(room);
        let mut done = 0;
        while done < len {
            self.load(&mut card, self.cursor).await?;
            let offset = self.cursor as usize % BLOCK_SIZE;
            let n = (len - done).min(BLOCK_SIZE - offset);
            self.buffer[offset..offset + n].copy_from_slice(&data[done..done + n]);
            self.dirty = true;
            done += n;
            self.cursor += n as u32;
        }
        self.size = self.size.max(self.cursor);
        Ok(len)
    }

    /// Write all of `data` or fail with [`SdcError::EndOfFile`]
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), SdcError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Write `line` followed by a newline
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), SdcError> {
        self.write_all(line).await?;
        self.write_all(b"\n").await
    }

    /// Move the cursor; positions up to the allocated size are valid
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, SdcError> {
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).ok(),
            SeekFrom::End(delta) => (self.size as i64).checked_add(delta),
            SeekFrom::Current(delta) => (self.cursor as i64).checked_add(delta),
        };
        match target {
            Some(target) if (0..=self.allocated as i64).contains(&target) => {
                self.cursor = target as u32;
                Ok(target as u64)
            }
            _ => Err(SdcError::InvalidSeek),
        }
    }

    /// Write the buffered sector back if it was modified
    pub async fn flush(&mut self) -> Result<(), SdcError> {
        let sdc = self.sdc;
        let mut card = sdc.card.lock().await;
        self.write_back(&mut card).await
    }

    /// Flush and store the file size in the directory entry
    pub async fn save(&mut self) -> Result<(), SdcError> {
        let sdc = self.sdc;
        let mut card = sdc.card.lock().await;
        self.write_back(&mut card).await?;

        if self.size != self.saved_size {
            let mut sector = [0u8; BLOCK_SIZE];
            let (lba, offset, size) = (self.entry_lba, self.entry_offset, self.size);
            keep_trying(&mut *card, &self.policy, async |card| {
                card.read_block_into(lba, &mut sector).await
            })
            .await?;

            let field = offset + DirEntry::SIZE_OFFSET;
            sector[field..field + 4].copy_from_slice(&size.to_le_bytes());
            keep_trying(&mut *card, &self.policy, async |card| {
                card.write_block(lba, &sector).await
            })
            .await?;

            self.saved_size = size;
            debug!("Saved file size {}", size);
        }
        Ok(())
    }

    /// Copy the next line into `out`
    ///
    /// A trailing `\r` is dropped. At end of file the returned line is empty
    /// with [`LineEnd::EndOfFile`].
    pub async fn get_next_line(&mut self, out: &mut [u8]) -> Result<Line, SdcError> {
        let sdc = self.sdc;
        let mut card = sdc.card.lock().await;

        self.prev_line = Some(self.cursor);
        let mut len = 0;
        let end = loop {
            if self.cursor >= self.size {
                break LineEnd::EndOfFile;
            }
            self.load(&mut card, self.cursor).await?;

            let offset = self.cursor as usize % BLOCK_SIZE;
            let in_file = (self.size - self.cursor) as usize;
            let chunk = &self.buffer[offset..BLOCK_SIZE.min(offset + in_file)];
            let room = out.len() - len;

            match chunk.iter().position(|&b| b == b'\n') {
                Some(newline) if newline <= room => {
                    out[len..len + newline].copy_from_slice(&chunk[..newline]);
                    len += newline;
                    self.cursor += newline as u32 + 1;
                    break LineEnd::Newline;
                }
                _ if chunk.len() > room => {
                    out[len..].copy_from_slice(&chunk[..room]);
                    len += room;
                    self.cursor += room as u32;
                    break LineEnd::Truncated;
                }
                _ => {
                    out[len..len + chunk.len()].copy_from_slice(chunk);
                    len += chunk.len();
                    self.cursor += chunk.len() as u32;
                }
            }
        };

        if end != LineEnd::Truncated && len > 0 && out[len - 1] == b'\r' {
            len -= 1;
        }
        Ok(Line { len, end })
    }

    /// Whether unread bytes remain
    pub fn is_there_next_line(&self) -> bool {
        self.cursor < self.size
    }

    /// Move back to the start of the line last returned by
    /// [`Self::get_next_line`]; only one line back
    pub fn seek_reader_prev_line(&mut self) -> Result<(), SdcError> {
        self.cursor = self.prev_line.take().ok_or(SdcError::NoPreviousLine)?;
        Ok(())
    }

    /// Make the sector holding byte `offset` the buffered sector
    async fn load(&mut self, card: &mut SdCard<'b, M, BUS, CS>, offset: u32) -> Result<(), SdcError> {
        let lba = self.lba_of(card, offset).await?;
        if self.buffer_lba == Some(lba) {
            return Ok(());
        }

        self.write_back(card).await?;
        self.buffer_lba = None;
        keep_trying(card, &self.policy, async |card| {
            card.read_block_into(lba, &mut self.buffer).await
        })
        .await?;
        self.buffer_lba = Some(lba);
        Ok(())
    }

    async fn write_back(&mut self, card: &mut SdCard<'b, M, BUS, CS>) -> Result<(), SdcError> {
        let Some(lba) = self.buffer_lba else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        keep_trying(card, &self.policy, async |card| {
            card.write_block(lba, &self.buffer).await
        })
        .await?;
        self.dirty = false;
        Ok(())
    }

    async fn lba_of(&self, card: &mut SdCard<'b, M, BUS, CS>, offset: u32) -> Result<u32, SdcError> {
        let volume = *card.volume()?;
        let cluster_index = offset / volume.cluster_bytes();
        let sector_in_cluster = (offset % volume.cluster_bytes()) / BLOCK_SIZE as u32;

        if cluster_index == 0 {
            return Ok(self.start_lba + sector_in_cluster);
        }

        let mut cluster = self.first_cluster;
        for _ in 0..cluster_index {
            cluster = keep_trying(card, &self.policy, async |card| {
                card.next_cluster(cluster).await
            })
            .await?
            .ok_or(SdcError::EndOfFile)?;
        }
        Ok(volume.cluster_lba(cluster)? + sector_in_cluster)
    }
}

impl<M: RawMutex, BUS, CS> Drop for SdcStream<'_, '_, M, BUS, CS> {
    fn drop(&mut self) {
        if self.dirty || self.size != self.saved_size {
            warn!("SD stream dropped with unsaved changes");
        }
    }
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> embedded_io_async::ErrorType
    for SdcStream<'_, '_, M, BUS, CS>
{
    type Error = SdcError;
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> embedded_io_async::Read
    for SdcStream<'_, '_, M, BUS, CS>
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SdcError> {
        SdcStream::read(self, buf).await
    }
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> embedded_io_async::Write
    for SdcStream<'_, '_, M, BUS, CS>
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, SdcError> {
        SdcStream::write(self, buf).await
    }

    async fn flush(&mut self) -> Result<(), SdcError> {
        SdcStream::flush(self).await
    }
}

impl<M: RawMutex, BUS: SpiBus, CS: OutputPin> embedded_io_async::Seek
    for SdcStream<'_, '_, M, BUS, CS>
{
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, SdcError> {
        SdcStream::seek(self, pos).await
    }
}
