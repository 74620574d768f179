//! Software-extended 64-bit monotonic clock
//!
//! A small free-running hardware counter is extended to 64 bits with an
//! overflow counter that is incremented by the counter-wrap interrupt. The
//! read routine runs inside a critical section and compensates for a wrap
//! that has happened but whose interrupt has not been serviced yet:
//!
//! ```text
//! counter  ──┐     ┌───────┐     ┌──
//!            │    /        │    /
//!            │   /         │   /
//!            └──/          └──/
//!               ^ wrap: flag set, ISR pending
//! ```
//!
//! If the pending flag is observed together with a counter value in the
//! lower half of the range, the wrap happened before the counter was sampled
//! and the epoch is one ahead of the overflow counter. A pending flag seen
//! with a counter in the upper half belongs to a wrap after the sample.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use hal_abstractions::{InterruptController, TimerUnit};

use crate::config::ClockConfig;

/// Tick count of the monotonic clock
pub type Ticks = u64;

const MICROS_PER_SEC: u64 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// 64-bit monotonic clock on top of a wrapping hardware counter
pub struct MonotonicClock<T> {
    timer: T,
    config: ClockConfig,
    /// Number of serviced counter wraps.
    ///
    /// 32 bits because ARMv7-M has no native 64-bit atomics. At 500 kHz on a
    /// 16-bit counter this lasts for more than 17 years.
    overflow_count: AtomicU32,
    overflow: Signal<CriticalSectionRawMutex, ()>,
}

impl<T: TimerUnit> MonotonicClock<T> {
    pub const fn new(timer: T, config: ClockConfig) -> Self {
        Self {
            timer,
            config,
            overflow_count: AtomicU32::new(0),
            overflow: Signal::new(),
        }
    }

    /// Start the hardware counter and enable its overflow interrupt
    ///
    /// Must be called exactly once, before any task reads the clock.
    pub fn init(&self, nvic: &impl InterruptController) {
        self.timer
            .configure_up_counter(self.config.prescaler(), self.config.auto_reload());
        self.timer.clear_overflow();
        self.timer.enable_overflow_interrupt();

        let irq = self.timer.irq();
        nvic.set_priority(irq, self.config.irq_priority);
        nvic.enable(irq);

        info!(
            "Monotonic clock started: {} Hz requested, {} Hz actual, {}-bit counter",
            self.config.tick_hz,
            self.config.actual_tick_hz(),
            self.config.counter_bits
        );
    }

    /// Current timestamp, from task context
    pub fn now(&self) -> Ticks {
        critical_section::with(|_| self.read())
    }

    /// Current timestamp, from interrupt context
    ///
    /// Identical to [`Self::now`]; kept separate so call sites document the
    /// context they run in.
    pub fn now_from_isr(&self) -> Ticks {
        critical_section::with(|_| self.read())
    }

    fn read(&self) -> Ticks {
        let max = self.config.max_counter_value();
        let counter = self.timer.counter() as u64;
        let wrap_pending = self.timer.overflow_pending();
        let epoch = self.overflow_count.load(Ordering::Relaxed) as u64;

        let wrapped_before_read = wrap_pending && counter < max / 2;
        (epoch + wrapped_before_read as u64) * max + counter
    }

    /// Counter-wrap interrupt handler
    pub fn on_overflow(&self) {
        let wrapped = critical_section::with(|_| {
            if !self.timer.overflow_pending() {
                return false;
            }
            self.timer.clear_overflow();
            let count = self.overflow_count.load(Ordering::Relaxed);
            self.overflow_count
                .store(count.wrapping_add(1), Ordering::Relaxed);
            true
        });
        if wrapped {
            self.overflow.signal(());
        }
    }

    /// Number of serviced counter wraps
    pub fn epoch(&self) -> u32 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Wait until the next counter wrap has been serviced
    pub async fn wait_overflow(&self) {
        self.overflow.wait().await
    }

    pub fn elapsed_since(&self, earlier: Ticks) -> Ticks {
        self.now().saturating_sub(earlier)
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Counter values per wrap
    pub fn max_counter_value(&self) -> u64 {
        self.config.max_counter_value()
    }

    pub fn ticks_to_ms(&self, ticks: Ticks) -> u64 {
        scale(ticks, self.config.actual_tick_hz() as u64, MILLIS_PER_SEC)
    }

    pub fn ms_to_ticks(&self, ms: u64) -> Ticks {
        scale(ms, MILLIS_PER_SEC, self.config.actual_tick_hz() as u64)
    }

    pub fn ticks_to_us(&self, ticks: Ticks) -> u64 {
        scale(ticks, self.config.actual_tick_hz() as u64, MICROS_PER_SEC)
    }

    pub fn us_to_ticks(&self, us: u64) -> Ticks {
        scale(us, MICROS_PER_SEC, self.config.actual_tick_hz() as u64)
    }
}

/// `value * to / from` without overflowing the intermediate product
const fn scale(value: u64, from: u64, to: u64) -> u64 {
    (value / from) * to + (value % from) * to / from
}
