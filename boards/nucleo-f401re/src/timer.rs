#![deny(unsafe_code)]

//! TIM3 as the counter behind the core monotonic clock
//!
//! TIM3 is a 16-bit general purpose timer on APB1. Channel 1 in output
//! compare (frozen) mode serves as the delay scheduler's compare channel;
//! update and capture/compare events share the TIM3 interrupt.

use cortex_m::interrupt::InterruptNumber;
use embassy_stm32::pac;
use hal_abstractions::{IrqNumber, TimerUnit};

const COMPARE_CHANNEL: usize = 0;

/// Register-level handle to TIM3
///
/// Zero-sized so the clock can live in a `static`. Nothing else in the
/// firmware may touch TIM3.
pub struct Tim3;

impl TimerUnit for Tim3 {
    fn configure_up_counter(&self, prescaler: u32, auto_reload: u32) {
        pac::RCC.apb1enr().modify(|w| w.set_tim3en(true));

        let tim = pac::TIM3;
        tim.cr1().modify(|w| w.set_cen(false));
        tim.psc().write_value(prescaler as u16);
        tim.arr().write(|w| w.set_arr(auto_reload as u16));
        tim.cnt().write(|w| w.set_cnt(0));
        // Load the prescaler now instead of at the first wrap
        tim.egr().write(|w| w.set_ug(true));
        tim.sr().write(|w| w.set_uif(false));
        tim.cr1().modify(|w| w.set_cen(true));
    }

    fn counter(&self) -> u32 {
        pac::TIM3.cnt().read().cnt() as u32
    }

    fn overflow_pending(&self) -> bool {
        pac::TIM3.sr().read().uif()
    }

    fn clear_overflow(&self) {
        // rc_w0: writing one leaves the other flags alone
        pac::TIM3.sr().write(|w| {
            w.0 = 0xFFFF;
            w.set_uif(false);
        });
    }

    fn enable_overflow_interrupt(&self) {
        pac::TIM3.dier().modify(|w| w.set_uie(true));
    }

    fn set_compare(&self, value: u32) {
        pac::TIM3
            .ccr(COMPARE_CHANNEL)
            .write(|w| w.set_ccr(value as u16));
    }

    fn compare_pending(&self) -> bool {
        pac::TIM3.sr().read().ccif(COMPARE_CHANNEL)
    }

    fn clear_compare(&self) {
        pac::TIM3.sr().write(|w| {
            w.0 = 0xFFFF;
            w.set_ccif(COMPARE_CHANNEL, false);
        });
    }

    fn enable_compare_interrupt(&self) {
        pac::TIM3
            .dier()
            .modify(|w| w.set_ccie(COMPARE_CHANNEL, true));
    }

    fn disable_compare_interrupt(&self) {
        pac::TIM3
            .dier()
            .modify(|w| w.set_ccie(COMPARE_CHANNEL, false));
    }

    fn irq(&self) -> IrqNumber {
        pac::Interrupt::TIM3.number()
    }
}
