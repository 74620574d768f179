//! SD card storage
//!
//! Layers, bottom to top:
//!
//! - [`crc`] and [`command`]: wire format of SPI mode
//! - [`card`]: command/response exchange, initialization, cached block I/O
//! - [`retry`]: repeat with re-initialization under a deadline
//! - [`fat`]: FAT32 boot sector, FAT and directory structures
//! - [`stream`]: the shared card handle and buffered file streams

pub mod card;
pub mod command;
pub mod crc;
pub mod fat;
pub mod retry;
pub mod stream;

pub use card::{CardVersion, LocatedEntry, SdCard};
pub use command::{Command, R1};
pub use fat::{ShortName, Volume};
pub use retry::{keep_trying, Recover};
pub use stream::{Line, LineEnd, Sdc, SdcStream};
