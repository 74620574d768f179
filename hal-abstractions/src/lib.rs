//! Hardware abstraction traits for STM32 firmware
//!
//! This crate defines the capabilities the platform-agnostic core consumes
//! from a board: a free-running timer with one compare channel, an interrupt
//! controller and a DMA controller. Board crates implement these traits over
//! their register blocks; host tests implement them over simulated state.
//!
//! Every method takes `&self`. Register access is interior-mutable on real
//! hardware and these handles are shared between task and interrupt context.

#![no_std]
#![deny(unsafe_code)]

/// Interrupt number as understood by the board's interrupt controller.
pub type IrqNumber = u16;

/// Free-running up-counting hardware timer with one compare channel
///
/// The counter counts `0..=auto_reload` and then wraps to zero, raising the
/// overflow (update) flag. The compare channel raises its own flag when the
/// counter equals the programmed compare value.
pub trait TimerUnit {
    /// Configure the timer for up-counting from the internal clock.
    ///
    /// `prescaler` divides the timer input clock by `prescaler + 1`. The
    /// counter wraps after reaching `auto_reload`. The counter is started.
    fn configure_up_counter(&self, prescaler: u32, auto_reload: u32);

    /// Current raw counter value.
    fn counter(&self) -> u32;

    /// Whether a counter wrap has happened that has not been cleared yet.
    fn overflow_pending(&self) -> bool;

    /// Clear the overflow flag.
    fn clear_overflow(&self);

    /// Enable the overflow interrupt.
    fn enable_overflow_interrupt(&self);

    /// Program the compare register.
    fn set_compare(&self, value: u32);

    /// Whether the counter has matched the compare register since the flag
    /// was last cleared.
    fn compare_pending(&self) -> bool;

    /// Clear the compare-match flag.
    fn clear_compare(&self);

    /// Enable the compare-match interrupt.
    fn enable_compare_interrupt(&self);

    /// Disable the compare-match interrupt.
    fn disable_compare_interrupt(&self);

    /// Interrupt line shared by overflow and compare events.
    fn irq(&self) -> IrqNumber;
}

/// Nested vectored interrupt controller
pub trait InterruptController {
    /// Set the priority of an interrupt line. Lower numbers are more urgent.
    fn set_priority(&self, irq: IrqNumber, priority: u8);

    /// Unmask an interrupt line.
    fn enable(&self, irq: IrqNumber);
}

/// A DMA (controller unit, channel) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaChannelId {
    /// DMA controller number (1 or 2 on STM32F4)
    pub unit: u8,
    /// Channel (stream) number within the controller
    pub channel: u8,
}

impl DmaChannelId {
    pub const fn new(unit: u8, channel: u8) -> Self {
        Self { unit, channel }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    PeripheralToMemory,
    MemoryToPeripheral,
    MemoryToMemory,
}

/// Description of one DMA transfer
///
/// Addresses are bus addresses. The caller keeps the memory behind them alive
/// until the transfer has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaTransfer {
    pub direction: DmaDirection,
    pub peripheral_address: u32,
    pub memory_address: u32,
    /// Number of data items to move
    pub count: u16,
    /// Request line / channel selection for the peripheral
    pub request: u8,
    pub increment_memory: bool,
    pub increment_peripheral: bool,
}

/// DMA controller capable of driving the channels of a pool
pub trait DmaHardware {
    /// Program and enable a transfer on `channel`, with the
    /// transfer-complete interrupt enabled.
    fn start_transfer(&self, channel: DmaChannelId, transfer: &DmaTransfer);

    /// Clear the transfer-complete flag of `channel`.
    fn clear_complete_flag(&self, channel: DmaChannelId);

    /// Interrupt line of `channel`.
    fn irq(&self, channel: DmaChannelId) -> IrqNumber;
}
