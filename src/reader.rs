//! File reader. Pure with respect to the disk layout: no mutation of the
//! allocation map or directory happens here.

use crate::container::SectorContainer;
use crate::deb::{Deb, FileOrganization};
use crate::endian::SECTOR_SIZE;
use crate::error::{OasisError, Result};

const SEQ_DATA_PER_SECTOR: usize = 254;
const SEQ_LINK_BYTES: usize = 2;
const CHAIN_SLACK_SECTORS: u32 = 16;

/// Reads a file's content given its DEB, dispatching to the contiguous or
/// sequential strategy by organization.
pub fn read_file(container: &mut dyn SectorContainer, deb: &Deb) -> Result<Vec<u8>> {
    let organization = deb
        .file_format
        .organization()
        .ok_or_else(|| OasisError::invalid_argument("DEB is not a valid file entry"))?;

    if organization == FileOrganization::Sequential {
        read_sequential(container, deb)
    } else {
        read_contiguous(container, deb, organization)
    }
}

fn read_contiguous(
    container: &mut dyn SectorContainer,
    deb: &Deb,
    organization: FileOrganization,
) -> Result<Vec<u8>> {
    let sector_count = deb.block_count as u32 * 4;
    let raw = container.read_sectors(deb.start_sector as u32, sector_count)?;
    let disk_read_size = raw.len();

    let logical_len = match organization {
        FileOrganization::Direct => deb.record_count as usize * deb.ffd1 as usize,
        FileOrganization::Indexed | FileOrganization::Keyed => {
            deb.record_count as usize * (deb.ffd1 as usize & 0x1FF)
        }
        FileOrganization::Relocatable => deb.ffd2 as usize,
        FileOrganization::Absolute => disk_read_size,
        FileOrganization::Sequential => unreachable!("handled by read_sequential"),
    };

    let clamped = logical_len.min(disk_read_size);
    Ok(raw[..clamped].to_vec())
}

fn read_sequential(container: &mut dyn SectorContainer, deb: &Deb) -> Result<Vec<u8>> {
    let max_sectors = deb.block_count as u32 * 4 + CHAIN_SLACK_SECTORS;
    let mut out = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut lba = deb.start_sector as u32;
    let mut steps = 0u32;

    loop {
        if lba == 0 {
            break;
        }
        if !visited.insert(lba) {
            return Err(OasisError::inconsistent(format!(
                "sequential chain cycles back to LBA {lba}"
            )));
        }
        steps += 1;
        if steps > max_sectors {
            return Err(OasisError::inconsistent(
                "sequential chain exceeds block_count * 4 + slack sectors",
            ));
        }

        let sector = container.read_sectors(lba, 1)?;
        if sector.len() < SECTOR_SIZE {
            return Err(OasisError::format("short sector read while walking chain"));
        }
        out.extend_from_slice(&sector[..SEQ_DATA_PER_SECTOR]);
        let next = u16::from_le_bytes([
            sector[SECTOR_SIZE - SEQ_LINK_BYTES],
            sector[SECTOR_SIZE - SEQ_LINK_BYTES + 1],
        ]) as u32;

        if next == 0 {
            if lba != deb.ffd2 as u32 {
                return Err(OasisError::inconsistent(format!(
                    "sequential chain terminates at LBA {lba}, expected FFD2 {}",
                    deb.ffd2
                )));
            }
            break;
        }
        lba = next;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deb::FileFormat;
    use crate::filename::OasisName;
    use crate::timestamp::OasisTimestamp;

    struct MemContainer {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl SectorContainer for MemContainer {
        fn total_sectors(&self) -> u32 {
            self.sectors.len() as u32
        }
        fn read_sectors(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
            let mut out = Vec::new();
            for i in 0..count {
                out.extend_from_slice(&self.sectors[(lba + i) as usize]);
            }
            Ok(out)
        }
        fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<()> {
            for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
                self.sectors[lba as usize + i].copy_from_slice(chunk);
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn base_deb() -> Deb {
        Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Direct,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("FOO", "DAT").unwrap(),
            record_count: 2,
            block_count: 1,
            start_sector: 4,
            ffd1: 100,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        }
    }

    #[test]
    fn contiguous_direct_trims_to_record_count_times_ffd1() {
        let mut container = MemContainer {
            sectors: vec![[0xAAu8; SECTOR_SIZE]; 8],
        };
        let deb = base_deb();
        let data = read_file(&mut container, &deb).unwrap();
        assert_eq!(data.len(), 200);
        assert!(data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn contiguous_absolute_returns_full_disk_read_size() {
        let mut container = MemContainer {
            sectors: vec![[0x55u8; SECTOR_SIZE]; 8],
        };
        let mut deb = base_deb();
        deb.file_format = FileFormat::Regular {
            organization: FileOrganization::Absolute,
            attributes: 0,
        };
        let data = read_file(&mut container, &deb).unwrap();
        assert_eq!(data.len(), deb.block_count as usize * 4 * SECTOR_SIZE);
    }

    fn chain_sector(payload: u8, next_lba: u16) -> [u8; SECTOR_SIZE] {
        let mut s = [payload; SECTOR_SIZE];
        s[SECTOR_SIZE - 2..].copy_from_slice(&next_lba.to_le_bytes());
        s
    }

    #[test]
    fn sequential_walks_chain_and_checks_terminal_ffd2() {
        let mut sectors = vec![[0u8; SECTOR_SIZE]; 64];
        sectors[10] = chain_sector(1, 20);
        sectors[20] = chain_sector(2, 0);
        let mut container = MemContainer { sectors };

        let mut deb = base_deb();
        deb.file_format = FileFormat::Regular {
            organization: FileOrganization::Sequential,
            attributes: 0,
        };
        deb.start_sector = 10;
        deb.block_count = 1;
        deb.ffd2 = 20;

        let data = read_file(&mut container, &deb).unwrap();
        assert_eq!(data.len(), SEQ_DATA_PER_SECTOR * 2);
        assert_eq!(data[0], 1);
        assert_eq!(data[SEQ_DATA_PER_SECTOR], 2);
    }

    #[test]
    fn sequential_terminal_mismatch_with_ffd2_is_an_error() {
        let mut sectors = vec![[0u8; SECTOR_SIZE]; 64];
        sectors[10] = chain_sector(1, 0);
        let mut container = MemContainer { sectors };

        let mut deb = base_deb();
        deb.file_format = FileFormat::Regular {
            organization: FileOrganization::Sequential,
            attributes: 0,
        };
        deb.start_sector = 10;
        deb.block_count = 1;
        deb.ffd2 = 99;

        assert!(read_file(&mut container, &deb).is_err());
    }

    #[test]
    fn sequential_cycle_is_detected() {
        let mut sectors = vec![[0u8; SECTOR_SIZE]; 64];
        sectors[10] = chain_sector(1, 20);
        sectors[20] = chain_sector(2, 10);
        let mut container = MemContainer { sectors };

        let mut deb = base_deb();
        deb.file_format = FileFormat::Regular {
            organization: FileOrganization::Sequential,
            attributes: 0,
        };
        deb.start_sector = 10;
        deb.block_count = 1;

        assert!(read_file(&mut container, &deb).is_err());
    }
}
