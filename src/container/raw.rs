//! Raw sector-image container: LBA `n` lives at file offset `n * 256`.

use super::{check_sector_aligned, SectorContainer};
use crate::endian::SECTOR_SIZE;
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct RawContainer {
    file: File,
    writable: bool,
}

impl RawContainer {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        Ok(RawContainer { file, writable })
    }
}

impl SectorContainer for RawContainer {
    fn total_sectors(&self) -> u32 {
        let len = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        (len / SECTOR_SIZE as u64) as u32
    }

    fn read_sectors(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let want = count as usize * SECTOR_SIZE;
        let mut buf = vec![0u8; want];
        let offset = lba as u64 * SECTOR_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        // Short or absent reads beyond EOF are zero-filled; full sectors
        // are always returned, never a partial one.
        let mut tmp = vec![0u8; want];
        let mut read_total = 0usize;
        loop {
            match self.file.read(&mut tmp[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) => return Err(e.into()),
            }
            if read_total == want {
                break;
            }
        }
        buf[..read_total].copy_from_slice(&tmp[..read_total]);
        Ok(buf)
    }

    fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(crate::error::OasisError::invalid_argument(
                "container opened read-only",
            ));
        }
        check_sector_aligned(data)?;
        let offset = lba as u64 * SECTOR_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_back() {
        let tmp = NamedTempFile::new().unwrap();
        let mut c = RawContainer::open(tmp.path(), true).unwrap();
        let sector = vec![0xAAu8; SECTOR_SIZE];
        c.write_sectors(3, &sector).unwrap();
        let back = c.read_sectors(3, 1).unwrap();
        assert_eq!(back, sector);
    }

    #[test]
    fn read_beyond_eof_is_zero_filled() {
        let tmp = NamedTempFile::new().unwrap();
        let mut c = RawContainer::open(tmp.path(), true).unwrap();
        let back = c.read_sectors(5, 2).unwrap();
        assert_eq!(back.len(), SECTOR_SIZE * 2);
        assert!(back.iter().all(|&b| b == 0));
    }

    #[test]
    fn total_sectors_reflects_file_size() {
        let tmp = NamedTempFile::new().unwrap();
        let mut c = RawContainer::open(tmp.path(), true).unwrap();
        c.write_sectors(9, &vec![1u8; SECTOR_SIZE]).unwrap();
        assert_eq!(c.total_sectors(), 10);
    }
}
