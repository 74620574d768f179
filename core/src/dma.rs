//! Pool of lockable DMA channels
//!
//! Every (unit, channel) pair of the pool has its own mutex. Tasks either ask
//! for any free channel, served FIFO from an availability queue, or for one
//! specific channel when the peripheral's DMA request line is wired to it.
//!
//! Locking a specific channel leaves its entry in the availability queue. A
//! task asking for any channel may therefore dequeue a channel that is
//! currently held; it drops the stale entry and tries the next one. The
//! entry is queued again when the holder releases the channel.
//!
//! Access is handed out as a [`DmaChannelGuard`]; dropping the guard releases
//! the channel.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};
use hal_abstractions::{DmaChannelId, DmaHardware, DmaTransfer, InterruptController};

use crate::config::DmaPoolConfig;
use crate::error::DmaError;

struct ChannelSlot {
    id: DmaChannelId,
    lock: Mutex<CriticalSectionRawMutex, ()>,
    /// Set while the channel's index sits in the availability queue
    in_queue: AtomicBool,
    complete: Signal<CriticalSectionRawMutex, ()>,
}

/// Fixed set of `N` DMA channels
pub struct DmaChannelPool<H, const N: usize> {
    hw: H,
    config: DmaPoolConfig,
    slots: [ChannelSlot; N],
    available: Channel<CriticalSectionRawMutex, usize, N>,
}

impl<H: DmaHardware, const N: usize> DmaChannelPool<H, N> {
    pub fn new(hw: H, channels: [DmaChannelId; N], config: DmaPoolConfig) -> Self {
        Self {
            hw,
            config,
            slots: channels.map(|id| ChannelSlot {
                id,
                lock: Mutex::new(()),
                in_queue: AtomicBool::new(false),
                complete: Signal::new(),
            }),
            available: Channel::new(),
        }
    }

    /// Queue every channel and enable its transfer-complete interrupt
    pub fn init(&self, nvic: &impl InterruptController) {
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.in_queue.swap(true, Ordering::AcqRel) {
                self.enqueue(index);
            }

            let irq = self.hw.irq(slot.id);
            nvic.set_priority(irq, self.config.irq_priority);
            nvic.enable(irq);
        }
        info!("DMA pool ready with {} channels", N);
    }

    /// Lock whichever channel becomes free first
    pub async fn lock_any_channel(
        &self,
        timeout: Duration,
    ) -> Result<DmaChannelGuard<'_, H, N>, DmaError> {
        let acquire = async {
            loop {
                let index = self.available.receive().await;
                let slot = &self.slots[index];
                slot.in_queue.store(false, Ordering::Release);
                if let Ok(lock) = slot.lock.try_lock() {
                    return DmaChannelGuard {
                        pool: self,
                        index,
                        lock: Some(lock),
                    };
                }
                trace!("DMA channel {:?} held through lock_channel", slot.id);
            }
        };

        with_timeout(timeout, acquire).await.map_err(|_| {
            debug!("No DMA channel free within timeout");
            DmaError::Timeout
        })
    }

    /// Lock one specific channel
    pub async fn lock_channel(
        &self,
        id: DmaChannelId,
        timeout: Duration,
    ) -> Result<DmaChannelGuard<'_, H, N>, DmaError> {
        let index = self.index_of(id).ok_or(DmaError::UnknownChannel)?;
        let lock = with_timeout(timeout, self.slots[index].lock.lock())
            .await
            .map_err(|_| {
                debug!("DMA channel {:?} not free within timeout", id);
                DmaError::Timeout
            })?;

        Ok(DmaChannelGuard {
            pool: self,
            index,
            lock: Some(lock),
        })
    }

    /// Transfer-complete interrupt handler for `id`
    pub fn on_transfer_complete(&self, id: DmaChannelId) {
        if let Some(index) = self.index_of(id) {
            self.hw.clear_complete_flag(id);
            self.slots[index].complete.signal(());
        }
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = DmaChannelId> + '_ {
        self.slots.iter().map(|slot| slot.id)
    }

    /// Number of entries in the availability queue, stale ones included
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    fn index_of(&self, id: DmaChannelId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    fn enqueue(&self, index: usize) {
        // Each index is queued at most once, so the queue never fills up
        if self.available.try_send(index).is_err() {
            self.slots[index].in_queue.store(false, Ordering::Release);
            error!("DMA availability queue full");
        }
    }
}

/// Exclusive access to one channel of a [`DmaChannelPool`]
pub struct DmaChannelGuard<'p, H: DmaHardware, const N: usize> {
    pool: &'p DmaChannelPool<H, N>,
    index: usize,
    lock: Option<MutexGuard<'p, CriticalSectionRawMutex, ()>>,
}

impl<H: DmaHardware, const N: usize> DmaChannelGuard<'_, H, N> {
    pub fn id(&self) -> DmaChannelId {
        self.slot().id
    }

    /// Program and start a transfer on the held channel
    pub fn start_transfer(&mut self, transfer: &DmaTransfer) {
        let slot = self.slot();
        slot.complete.reset();
        self.pool.hw.start_transfer(slot.id, transfer);
    }

    /// Wait for the transfer-complete interrupt
    pub async fn block_until_complete(&self) {
        self.slot().complete.wait().await
    }

    /// Wait for the transfer-complete interrupt, giving up after `timeout`
    pub async fn block_until_complete_timeout(&self, timeout: Duration) -> Result<(), DmaError> {
        with_timeout(timeout, self.block_until_complete())
            .await
            .map_err(|_| DmaError::Timeout)
    }

    pub fn clear_complete_flag(&self) {
        self.pool.hw.clear_complete_flag(self.slot().id);
    }

    /// Release the channel; same as dropping the guard
    pub fn release(self) {}

    fn slot(&self) -> &ChannelSlot {
        &self.pool.slots[self.index]
    }
}

impl<H: DmaHardware, const N: usize> Drop for DmaChannelGuard<'_, H, N> {
    fn drop(&mut self) {
        // Unlock before queueing so a dequeuer never finds the entry locked
        drop(self.lock.take());
        if !self.slot().in_queue.swap(true, Ordering::AcqRel) {
            self.pool.enqueue(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingDma, RecordingNvic};
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::yield_now;
    use hal_abstractions::DmaDirection;

    const NOW: Duration = Duration::from_ticks(0);
    const STREAM0: DmaChannelId = DmaChannelId::new(2, 0);
    const STREAM3: DmaChannelId = DmaChannelId::new(2, 3);

    fn pool() -> DmaChannelPool<RecordingDma, 2> {
        let pool = DmaChannelPool::new(
            RecordingDma::default(),
            [STREAM0, STREAM3],
            DmaPoolConfig::default(),
        );
        pool.init(&RecordingNvic::default());
        pool
    }

    #[test]
    fn test_init_queues_channels_and_enables_irqs() {
        let nvic = RecordingNvic::default();
        let pool = DmaChannelPool::new(
            RecordingDma::default(),
            [STREAM0, STREAM3],
            DmaPoolConfig::default(),
        );
        pool.init(&nvic);

        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.channel_ids().collect::<Vec<_>>(), [STREAM0, STREAM3]);
        for irq in [RecordingDma::BASE_IRQ, RecordingDma::BASE_IRQ + 3] {
            assert_eq!(nvic.priority(irq), Some(15));
            assert!(nvic.is_enabled(irq));
        }

        // A second init does not queue duplicates
        pool.init(&nvic);
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_any_channel_is_fifo() {
        let pool = pool();
        block_on(async {
            let first = pool.lock_any_channel(NOW).await.unwrap();
            let second = pool.lock_any_channel(NOW).await.unwrap();
            assert_eq!(first.id(), STREAM0);
            assert_eq!(second.id(), STREAM3);
            assert_eq!(pool.lock_any_channel(NOW).await.err(), Some(DmaError::Timeout));
        });
    }

    #[test]
    fn test_only_one_of_two_concurrent_requests_wins() {
        let pool = pool();
        block_on(async {
            let _pinned = pool.lock_channel(STREAM3, NOW).await.unwrap();

            let (a, b) = join(pool.lock_any_channel(NOW), pool.lock_any_channel(NOW)).await;
            assert!(a.is_ok() != b.is_ok());

            let winner = a.or(b).unwrap();
            assert_eq!(winner.id(), STREAM0);
            assert_eq!(pool.lock_any_channel(NOW).await.err(), Some(DmaError::Timeout));

            winner.release();
            let next = pool.lock_any_channel(NOW).await.unwrap();
            assert_eq!(next.id(), STREAM0);
        });
    }

    #[test]
    fn test_release_of_pinned_channel_requeues_stale_entry() {
        let pool = pool();
        block_on(async {
            let pinned = pool.lock_channel(STREAM3, NOW).await.unwrap();
            let _any = pool.lock_any_channel(NOW).await.unwrap();
            // Drops the stale STREAM3 entry and times out
            assert!(pool.lock_any_channel(NOW).await.is_err());
            assert_eq!(pool.available_count(), 0);

            drop(pinned);
            assert_eq!(pool.available_count(), 1);
            let again = pool.lock_any_channel(NOW).await.unwrap();
            assert_eq!(again.id(), STREAM3);
        });
    }

    #[test]
    fn test_pinned_release_without_dequeue_does_not_duplicate() {
        let pool = pool();
        block_on(async {
            let pinned = pool.lock_channel(STREAM0, NOW).await.unwrap();
            drop(pinned);
            assert_eq!(pool.available_count(), 2);
        });
    }

    #[test]
    fn test_lock_channel_waits_for_holder() {
        let pool = pool();
        let held = block_on(pool.lock_channel(STREAM0, NOW)).unwrap();

        let (second, ()) = block_on(join(
            pool.lock_channel(STREAM0, Duration::from_secs(5)),
            async move {
                yield_now().await;
                drop(held);
            },
        ));
        assert_eq!(second.unwrap().id(), STREAM0);
    }

    #[test]
    fn test_lock_channel_timeout_and_unknown() {
        let pool = pool();
        block_on(async {
            let _held = pool.lock_channel(STREAM0, NOW).await.unwrap();
            assert_eq!(
                pool.lock_channel(STREAM0, Duration::from_millis(5)).await.err(),
                Some(DmaError::Timeout)
            );
            assert_eq!(
                pool.lock_channel(DmaChannelId::new(1, 7), NOW).await.err(),
                Some(DmaError::UnknownChannel)
            );
        });
    }

    #[test]
    fn test_transfer_completion() {
        let pool = pool();
        let transfer = DmaTransfer {
            direction: DmaDirection::MemoryToPeripheral,
            peripheral_address: 0x4001_300C,
            memory_address: 0x2000_0000,
            count: 512,
            request: 3,
            increment_memory: true,
            increment_peripheral: false,
        };

        block_on(async {
            let mut channel = pool.lock_channel(STREAM3, NOW).await.unwrap();
            channel.start_transfer(&transfer);
            assert_eq!(pool.hardware().started(), [(STREAM3, transfer)]);

            pool.on_transfer_complete(STREAM3);
            channel
                .block_until_complete_timeout(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(pool.hardware().cleared(), [STREAM3]);

            // No interrupt for the next transfer yet
            channel.start_transfer(&transfer);
            assert_eq!(
                channel.block_until_complete_timeout(NOW).await,
                Err(DmaError::Timeout)
            );
        });
    }
}
