//! Timekeeping: the extended monotonic clock and the delay scheduler that
//! shares its timer

mod clock;
mod scheduler;

pub use clock::{MonotonicClock, Ticks};
pub use scheduler::{
    plan, DelayHandle, DelayScheduler, PendingDelay, Plan, SchedulerEvent, SchedulerState,
};
