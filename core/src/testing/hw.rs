use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::vec::Vec;

use hal_abstractions::{
    DmaChannelId, DmaHardware, DmaTransfer, InterruptController, IrqNumber, TimerUnit,
};

/// Simulated up-counting timer
///
/// The counter only moves when a test calls [`SimTimer::advance`]. Flags are
/// raised the way the hardware raises them; nothing is dispatched, tests call
/// the interrupt handlers themselves.
pub struct SimTimer {
    counter: Cell<u32>,
    prescaler: Cell<u32>,
    auto_reload: Cell<u32>,
    overflow_flag: Cell<bool>,
    overflow_irq: Cell<bool>,
    compare: Cell<u32>,
    compare_flag: Cell<bool>,
    compare_irq: Cell<bool>,
}

impl SimTimer {
    pub const IRQ: IrqNumber = 29;

    pub fn new() -> Self {
        Self {
            counter: Cell::new(0),
            prescaler: Cell::new(0),
            auto_reload: Cell::new(0xFFFF),
            overflow_flag: Cell::new(false),
            overflow_irq: Cell::new(false),
            compare: Cell::new(0),
            compare_flag: Cell::new(false),
            compare_irq: Cell::new(false),
        }
    }

    pub fn prescaler(&self) -> u32 {
        self.prescaler.get()
    }

    pub fn auto_reload(&self) -> u32 {
        self.auto_reload.get()
    }

    pub fn overflow_interrupt_enabled(&self) -> bool {
        self.overflow_irq.get()
    }

    pub fn compare_interrupt_enabled(&self) -> bool {
        self.compare_irq.get()
    }

    /// Count `ticks` timer ticks
    pub fn advance(&self, ticks: u32) {
        for _ in 0..ticks {
            let next = if self.counter.get() >= self.auto_reload.get() {
                self.overflow_flag.set(true);
                0
            } else {
                self.counter.get() + 1
            };
            if next == self.compare.get() {
                self.compare_flag.set(true);
            }
            self.counter.set(next);
        }
    }

    /// Raise the overflow flag without moving the counter
    pub fn force_overflow_flag(&self) {
        self.overflow_flag.set(true);
    }
}

impl TimerUnit for SimTimer {
    fn configure_up_counter(&self, prescaler: u32, auto_reload: u32) {
        self.prescaler.set(prescaler);
        self.auto_reload.set(auto_reload);
        self.counter.set(0);
    }

    fn counter(&self) -> u32 {
        self.counter.get()
    }

    fn overflow_pending(&self) -> bool {
        self.overflow_flag.get()
    }

    fn clear_overflow(&self) {
        self.overflow_flag.set(false);
    }

    fn enable_overflow_interrupt(&self) {
        self.overflow_irq.set(true);
    }

    fn set_compare(&self, value: u32) {
        self.compare.set(value);
    }

    fn compare_pending(&self) -> bool {
        self.compare_flag.get()
    }

    fn clear_compare(&self) {
        self.compare_flag.set(false);
    }

    fn enable_compare_interrupt(&self) {
        self.compare_irq.set(true);
    }

    fn disable_compare_interrupt(&self) {
        self.compare_irq.set(false);
    }

    fn irq(&self) -> IrqNumber {
        Self::IRQ
    }
}

/// Interrupt controller that remembers what it was told
#[derive(Default)]
pub struct RecordingNvic {
    priorities: RefCell<HashMap<IrqNumber, u8>>,
    enabled: RefCell<Vec<IrqNumber>>,
}

impl RecordingNvic {
    pub fn priority(&self, irq: IrqNumber) -> Option<u8> {
        self.priorities.borrow().get(&irq).copied()
    }

    pub fn is_enabled(&self, irq: IrqNumber) -> bool {
        self.enabled.borrow().contains(&irq)
    }
}

impl InterruptController for RecordingNvic {
    fn set_priority(&self, irq: IrqNumber, priority: u8) {
        self.priorities.borrow_mut().insert(irq, priority);
    }

    fn enable(&self, irq: IrqNumber) {
        self.enabled.borrow_mut().push(irq);
    }
}

/// DMA controller that records started transfers and cleared flags
#[derive(Default)]
pub struct RecordingDma {
    started: RefCell<Vec<(DmaChannelId, DmaTransfer)>>,
    cleared: RefCell<Vec<DmaChannelId>>,
}

impl RecordingDma {
    /// Interrupt line of the first channel; channel `n` uses `BASE_IRQ + n`
    pub const BASE_IRQ: IrqNumber = 56;

    pub fn started(&self) -> Vec<(DmaChannelId, DmaTransfer)> {
        self.started.borrow().clone()
    }

    pub fn cleared(&self) -> Vec<DmaChannelId> {
        self.cleared.borrow().clone()
    }
}

impl DmaHardware for RecordingDma {
    fn start_transfer(&self, channel: DmaChannelId, transfer: &DmaTransfer) {
        self.started.borrow_mut().push((channel, *transfer));
    }

    fn clear_complete_flag(&self, channel: DmaChannelId) {
        self.cleared.borrow_mut().push(channel);
    }

    fn irq(&self, channel: DmaChannelId) -> IrqNumber {
        Self::BASE_IRQ + channel.channel as IrqNumber
    }
}
