//! Sector I/O abstraction over container formats.
//!
//! Everything above this layer (the disk layout loader and up) addresses
//! storage purely in terms of 256-byte logical sectors by LBA; it never
//! sees a raw file offset or an IMD track record.

use crate::endian::SECTOR_SIZE;
use crate::error::{OasisError, Result};
use std::path::Path;

pub mod imd;
pub mod raw;

/// Opens by file extension: `.imd`/`.IMD` selects the ImageDisk adapter,
/// anything else is treated as a raw sector image.
pub fn open(path: &Path, writable: bool) -> Result<Box<dyn SectorContainer>> {
    let is_imd = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("imd"))
        .unwrap_or(false);
    if is_imd {
        Ok(Box::new(imd::ImdContainer::open(path, writable)?))
    } else {
        Ok(Box::new(raw::RawContainer::open(path, writable)?))
    }
}

pub trait SectorContainer {
    /// Total addressable logical sectors in this image.
    fn total_sectors(&self) -> u32;

    /// Reads `count` consecutive 256-byte sectors starting at `lba`.
    fn read_sectors(&mut self, lba: u32, count: u32) -> Result<Vec<u8>>;

    /// Writes consecutive 256-byte sectors starting at `lba`. `data.len()`
    /// must be a multiple of [`SECTOR_SIZE`].
    fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// The container-level reset a full format performs before a fresh
    /// filesystem is laid down. A raw image has no sector-status metadata
    /// to reset, so the default is a no-op; containers that carry
    /// per-sector state override it.
    fn blank(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn check_sector_aligned(data: &[u8]) -> Result<u32> {
    if data.len() % SECTOR_SIZE != 0 {
        return Err(OasisError::invalid_argument(format!(
            "buffer length {} is not a multiple of the sector size",
            data.len()
        )));
    }
    Ok((data.len() / SECTOR_SIZE) as u32)
}
