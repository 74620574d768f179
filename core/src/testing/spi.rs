use core::convert::Infallible;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal_async::spi::{ErrorType, SpiBus};

/// SPI bus answering reads from a fixed script
///
/// Writes are recorded and consume nothing; reads take bytes from the script
/// and see 0xFF once it runs out.
pub struct ScriptedBus {
    miso: VecDeque<u8>,
    mosi: Vec<u8>,
}

impl ScriptedBus {
    pub fn new(script: &[u8]) -> Self {
        Self {
            miso: script.iter().copied().collect(),
            mosi: Vec::new(),
        }
    }

    /// Everything the host wrote
    pub fn written(&self) -> Vec<u8> {
        self.mosi.clone()
    }

    /// Script bytes not read yet
    pub fn remaining(&self) -> usize {
        self.miso.len()
    }

    fn next(&mut self) -> u8 {
        self.miso.pop_front().unwrap_or(0xFF)
    }
}

impl ErrorType for ScriptedBus {
    type Error = Infallible;
}

impl SpiBus for ScriptedBus {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        for word in words {
            *word = self.next();
        }
        Ok(())
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        self.mosi.extend_from_slice(words);
        Ok(())
    }

    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        self.mosi.extend_from_slice(write);
        for word in read {
            *word = self.next();
        }
        Ok(())
    }

    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        for word in words {
            self.mosi.push(*word);
            *word = self.next();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Chip-select pin whose state is shared between clones
#[derive(Clone, Default)]
pub struct MockPin {
    high: Rc<Cell<bool>>,
}

impl MockPin {
    pub fn is_high(&self) -> bool {
        self.high.get()
    }
}

impl PinErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.high.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.high.set(true);
        Ok(())
    }
}
