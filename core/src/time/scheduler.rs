//! Software delays multiplexed onto one hardware compare channel
//!
//! Any number of tasks can wait for an arbitrary tick count. Pending delays
//! live in a [`DeadlineHeap`] ordered by absolute deadline, and a single
//! scheduler task always keeps the compare channel programmed for the
//! nearest one:
//!
//! ```text
//!            DelayQueued
//!   Idle ───────────────▶ Configuring ◀──────────────────────┐
//!    ▲                    │  │  │                            │
//!    │       Plan::Idle   │  │  │ Plan::Arm                  │ CompareFired
//!    └────────────────────┘  │  └──────────▶ Armed ──────────┤ DelayQueued
//!                            │ Plan::WaitForEpoch             │ DeadlineMissed
//!                            └─────────▶ WaitingForEpoch ─────┘ EpochAdvanced
//! ```
//!
//! The compare register only holds the low bits of a timestamp, so a
//! deadline is armed only once the clock has entered the deadline's epoch.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use hal_abstractions::TimerUnit;

use super::clock::{MonotonicClock, Ticks};
use crate::error::SchedulerError;
use crate::heap::DeadlineHeap;

/// A reusable delay object
///
/// One task at a time may wait on a handle; a second concurrent
/// [`DelayScheduler::delay`] on the same handle fails with
/// [`SchedulerError::HandleBusy`].
pub struct DelayHandle {
    done: Signal<CriticalSectionRawMutex, ()>,
    busy: AtomicBool,
}

impl DelayHandle {
    pub const fn new() -> Self {
        Self {
            done: Signal::new(),
            busy: AtomicBool::new(false),
        }
    }

    /// Whether a delay on this handle is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Default for DelayHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap entry: a handle waiting for its deadline
#[derive(Clone, Copy)]
pub struct PendingDelay<'a> {
    pub deadline: Ticks,
    handle: &'a DelayHandle,
}

impl PartialEq for PendingDelay<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for PendingDelay<'_> {}

impl PartialOrd for PendingDelay<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingDelay<'_> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// What to do about the nearest deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Plan {
    /// Nothing pending
    Idle,
    /// The deadline has already passed
    Expire,
    /// The deadline lies in a later epoch than the current one
    WaitForEpoch,
    /// Program the compare channel
    Arm { deadline: Ticks, compare: u32 },
}

/// Decide how to serve `nearest` at time `now`
pub fn plan(nearest: Option<Ticks>, now: Ticks, max_counter_value: u64) -> Plan {
    match nearest {
        None => Plan::Idle,
        Some(deadline) if deadline <= now => Plan::Expire,
        Some(deadline) if deadline / max_counter_value != now / max_counter_value => {
            Plan::WaitForEpoch
        }
        Some(deadline) => Plan::Arm {
            deadline,
            compare: (deadline % max_counter_value) as u32,
        },
    }
}

/// Scheduler task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerState {
    Idle,
    Configuring,
    WaitingForEpoch,
    Armed,
}

/// Inputs of the scheduler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerEvent {
    /// A delay was inserted into the heap
    DelayQueued,
    /// The nearest deadline was evaluated
    Planned(Plan),
    /// The compare channel matched
    CompareFired,
    /// The deadline passed while the channel was being armed
    DeadlineMissed,
    /// The counter wrapped
    EpochAdvanced,
}

impl SchedulerState {
    pub fn transition(self, event: SchedulerEvent) -> Self {
        use SchedulerEvent as E;
        use SchedulerState as S;

        match (self, event) {
            (_, E::DelayQueued) => S::Configuring,
            (S::Configuring, E::Planned(Plan::Idle)) => S::Idle,
            (S::Configuring, E::Planned(Plan::Expire)) => S::Configuring,
            (S::Configuring, E::Planned(Plan::WaitForEpoch)) => S::WaitingForEpoch,
            (S::Configuring, E::Planned(Plan::Arm { .. })) => S::Armed,
            (S::Armed, E::CompareFired | E::DeadlineMissed) => S::Configuring,
            (S::WaitingForEpoch, E::EpochAdvanced) => S::Configuring,
            (state, _) => state,
        }
    }
}

/// Delay engine driving one compare channel of the clock's timer
pub struct DelayScheduler<'a, T, const N: usize> {
    clock: &'a MonotonicClock<T>,
    heap: Mutex<CriticalSectionRawMutex, RefCell<DeadlineHeap<PendingDelay<'a>, N>>>,
    queued: Signal<CriticalSectionRawMutex, ()>,
    fired: Signal<CriticalSectionRawMutex, ()>,
}

impl<'a, T: TimerUnit, const N: usize> DelayScheduler<'a, T, N> {
    pub const fn new(clock: &'a MonotonicClock<T>) -> Self {
        Self {
            clock,
            heap: Mutex::new(RefCell::new(DeadlineHeap::new())),
            queued: Signal::new(),
            fired: Signal::new(),
        }
    }

    /// Wait for `ticks` clock ticks
    pub async fn delay(&self, handle: &'a DelayHandle, ticks: Ticks) -> Result<(), SchedulerError> {
        if handle.busy.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::HandleBusy);
        }

        let deadline = self.clock.now().saturating_add(ticks);
        handle.done.reset();

        let queued = self
            .heap
            .lock(|heap| heap.borrow_mut().push(PendingDelay { deadline, handle }));
        if let Err(e) = queued {
            handle.busy.store(false, Ordering::Release);
            return Err(e.into());
        }
        self.queued.signal(());

        handle.done.wait().await;
        Ok(())
    }

    pub async fn delay_ms(&self, handle: &'a DelayHandle, ms: u64) -> Result<(), SchedulerError> {
        self.delay(handle, self.clock.ms_to_ticks(ms)).await
    }

    pub async fn delay_us(&self, handle: &'a DelayHandle, us: u64) -> Result<(), SchedulerError> {
        self.delay(handle, self.clock.us_to_ticks(us)).await
    }

    /// Number of delays waiting for their deadline
    pub fn pending(&self) -> usize {
        self.heap.lock(|heap| heap.borrow().len())
    }

    /// Compare-match interrupt handler
    pub fn on_compare(&self) {
        let timer = self.clock.timer();
        if !timer.compare_pending() {
            return;
        }
        timer.disable_compare_interrupt();
        timer.clear_compare();
        self.fired.signal(());
    }

    /// Scheduler task body
    pub async fn run(&self) -> ! {
        let mut state = SchedulerState::Idle;
        loop {
            let event = match state {
                SchedulerState::Idle => {
                    self.queued.wait().await;
                    SchedulerEvent::DelayQueued
                }
                SchedulerState::Configuring => self.configure(),
                SchedulerState::WaitingForEpoch => {
                    match select(self.clock.wait_overflow(), self.queued.wait()).await {
                        Either::First(()) => SchedulerEvent::EpochAdvanced,
                        Either::Second(()) => SchedulerEvent::DelayQueued,
                    }
                }
                SchedulerState::Armed => match select(self.fired.wait(), self.queued.wait()).await {
                    Either::First(()) => {
                        self.expire_due();
                        SchedulerEvent::CompareFired
                    }
                    Either::Second(()) => {
                        self.disarm();
                        SchedulerEvent::DelayQueued
                    }
                },
            };

            let next = state.transition(event);
            trace!("delay scheduler: {:?} -> {:?}", state, next);
            state = next;
        }
    }

    fn configure(&self) -> SchedulerEvent {
        // Everything queued so far is visible to the plan below
        self.queued.reset();

        let nearest = self
            .heap
            .lock(|heap| heap.borrow().peek().map(|p| p.deadline));
        let plan = plan(nearest, self.clock.now(), self.clock.max_counter_value());

        match plan {
            Plan::Expire => self.expire_due(),
            Plan::Arm { deadline, compare } => {
                self.arm(compare);
                if self.clock.now() >= deadline {
                    // The match may have happened before the interrupt was enabled
                    self.disarm();
                    self.expire_due();
                    return SchedulerEvent::DeadlineMissed;
                }
            }
            Plan::Idle | Plan::WaitForEpoch => {}
        }
        SchedulerEvent::Planned(plan)
    }

    fn arm(&self, compare: u32) {
        let timer = self.clock.timer();
        self.fired.reset();
        timer.set_compare(compare);
        timer.clear_compare();
        timer.enable_compare_interrupt();
    }

    fn disarm(&self) {
        let timer = self.clock.timer();
        timer.disable_compare_interrupt();
        timer.clear_compare();
        self.fired.reset();
    }

    /// Release every delay whose deadline has passed
    fn expire_due(&self) {
        let now = self.clock.now();
        loop {
            let due = self.heap.lock(|heap| {
                let mut heap = heap.borrow_mut();
                match heap.peek() {
                    Some(top) if top.deadline <= now => heap.pop(),
                    _ => None,
                }
            });
            let Some(expired) = due else { break };
            expired.handle.busy.store(false, Ordering::Release);
            expired.handle.done.signal(());
        }
    }
}
