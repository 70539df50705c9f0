//! 25-series SPI flash driver, SFDP discovery, and sparse memory images.

mod image;
mod sfdp;
mod spi25;

pub use image::MemoryImage;
pub use sfdp::{FastReadMode, JedecFlashParameters, SfdpError, SfdpParser, SfdpTable};
pub use spi25::{no_progress, Flash25, ProgressFn, Spi25Error, BIT_WEL, BIT_WIP, MSK_PROT};
