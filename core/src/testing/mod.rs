//! Hardware doubles for host tests

mod hw;
mod sdcard;
mod spi;

pub use hw::{RecordingDma, RecordingNvic, SimTimer};
pub use sdcard::{EmulatedCard, FatImage, SdCardEmulator};
pub use spi::{MockPin, ScriptedBus};
