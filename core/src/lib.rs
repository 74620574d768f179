//! Platform-agnostic timekeeping, DMA and SD-card storage for STM32 firmware
//!
//! This crate contains the logic shared by all boards. It has NO chip
//! dependency: timers, interrupt controllers and DMA controllers are consumed
//! through the traits in `hal-abstractions`, and the SD card is driven over
//! any `embedded-hal-async` SPI bus.
//!
//! # Crate structure
//!
//! | Module | Contents |
//! | ------ | -------- |
//! | [`time`] | 64-bit monotonic clock over a wrapping counter, delay scheduler on one compare channel |
//! | [`heap`] | Fixed-capacity binary heap ordering pending deadlines |
//! | [`dma`] | Pool of lockable DMA channels |
//! | [`sdc`] | SD card in SPI mode, FAT32 root-directory lookup, buffered file streams |
//! | [`config`] | Configuration structures with defaults |
//! | [`error`] | Error types |

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
mod fmt;

pub mod config;
pub mod dma;
pub mod error;
pub mod heap;
pub mod sdc;
pub mod time;

#[cfg(test)]
mod testing;

pub use config::{ClockConfig, DmaPoolConfig, RetryPolicy, SdcConfig};
pub use error::{CapacityExceeded, DmaError, SchedulerError, SdcError};
