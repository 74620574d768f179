//! NVIC access for the core crate
//!
//! This module is the **ONLY** place in the firmware with `unsafe` code.
//! Changing priorities and unmasking lines by number bypasses RTIC's
//! resource analysis, so it is limited to the interrupts RTIC binds to
//! hardware tasks, at the priorities RTIC gives them.
//!
//! # Priority levels
//!
//! [`InterruptController`] priorities are logical NVIC levels, 0 being the
//! most urgent. An RTIC task of priority `p` runs at level
//! `(1 << NVIC_PRIO_BITS) - p`; see [`rtic_level`].

#![allow(unsafe_code)]

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;
use embassy_stm32::NVIC_PRIO_BITS;
use hal_abstractions::{InterruptController, IrqNumber};

/// Logical NVIC level of an RTIC task priority
pub const fn rtic_level(task_priority: u8) -> u8 {
    (1 << NVIC_PRIO_BITS) - task_priority
}

#[derive(Clone, Copy)]
struct Line(IrqNumber);

// SAFETY: lines are only built from numbers reported by the chip's own
// peripherals, which are valid device interrupts.
unsafe impl InterruptNumber for Line {
    fn number(self) -> u16 {
        self.0
    }
}

pub struct Nvic;

impl InterruptController for Nvic {
    fn set_priority(&self, irq: IrqNumber, priority: u8) {
        // SAFETY: called from `init` with interrupts disabled; the level
        // equals the one RTIC assigned to the bound task.
        unsafe {
            let mut nvic = cortex_m::Peripherals::steal().NVIC;
            nvic.set_priority(Line(irq), priority << (8 - NVIC_PRIO_BITS));
        }
    }

    fn enable(&self, irq: IrqNumber) {
        // SAFETY: the line has a bound RTIC hardware task.
        unsafe { NVIC::unmask(Line(irq)) }
    }
}
