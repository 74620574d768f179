//! Configuration structures

use embassy_time::Duration;

/// Monotonic clock configuration
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    /// Input clock of the hardware timer in Hz
    pub timer_clock_hz: u32,
    /// Requested tick rate in Hz
    pub tick_hz: u32,
    /// Width of the hardware counter (16 or 32)
    pub counter_bits: u32,
    /// Priority of the overflow/compare interrupt.
    ///
    /// Must not be more urgent than the most urgent priority allowed to use
    /// the synchronization primitives.
    pub irq_priority: u8,
}

impl ClockConfig {
    /// Prescaler value that gets closest to `tick_hz` without exceeding it
    pub const fn prescaler(&self) -> u32 {
        let div = self.timer_clock_hz.div_ceil(self.tick_hz);
        if div == 0 {
            0
        } else {
            div - 1
        }
    }

    /// Tick rate actually produced by [`Self::prescaler`]
    pub const fn actual_tick_hz(&self) -> u32 {
        self.timer_clock_hz / (self.prescaler() + 1)
    }

    /// Number of counter values per wrap (`2^counter_bits`)
    pub const fn max_counter_value(&self) -> u64 {
        1u64 << self.counter_bits
    }

    /// Auto-reload value for a full-range free-running counter
    pub const fn auto_reload(&self) -> u32 {
        (self.max_counter_value() - 1) as u32
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        // APB1 timer clock of an F401 at 84 MHz, 16-bit general purpose timer
        Self {
            timer_clock_hz: 84_000_000,
            tick_hz: 500_000,
            counter_bits: 16,
            irq_priority: 5,
        }
    }
}

/// Retry policy for block-level and stream-level card operations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive failures after which the card is re-initialized
    pub attempts_before_reinit: u32,
    /// Overall deadline for the operation, including re-initializations
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts_before_reinit: 3,
            timeout: Duration::from_millis(2000),
        }
    }
}

/// SD card configuration
#[derive(Debug, Clone, Copy)]
pub struct SdcConfig {
    /// Enable CRC checking on the card side (CMD59) and on received blocks
    pub crc_enabled: bool,
    /// Bytes polled while waiting for an R1 response
    pub response_poll_bytes: usize,
    /// Bytes polled while waiting for a data-start token
    pub data_token_poll_bytes: usize,
    /// Bytes polled while waiting for the card to release busy after a write
    pub busy_poll_bytes: usize,
    /// Attempts of CMD0/ACMD41/CMD1 during initialization
    pub init_attempts: u32,
    /// Pause between initialization attempts
    pub init_poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SdcConfig {
    fn default() -> Self {
        Self {
            crc_enabled: true,
            response_poll_bytes: 8,
            data_token_poll_bytes: 4096,
            busy_poll_bytes: 65_536,
            init_attempts: 1000,
            init_poll_interval: Duration::from_millis(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// DMA channel pool configuration
#[derive(Debug, Clone, Copy)]
pub struct DmaPoolConfig {
    /// Priority of the transfer-complete interrupts
    pub irq_priority: u8,
}

impl Default for DmaPoolConfig {
    fn default() -> Self {
        // Least urgent priority with 4 NVIC priority bits
        Self { irq_priority: 15 }
    }
}
