//! Disk layout loader/writer.
//!
//! A [`DiskLayout`] owns the in-memory filesystem block, allocation map and
//! directory for one open image. It never touches the container directly
//! except through [`load`](DiskLayout::load) and [`save`](DiskLayout::save);
//! every mutator (file writer, initializer) works against the in-memory
//! copy and calls `save` to write the surfaces back as a whole.

use crate::alloc_map::AllocationMap;
use crate::container::SectorContainer;
use crate::deb::{Deb, DebWire, DEB_SIZE};
use crate::endian::{read_u16_le, write_u16_le, SECTOR_SIZE};
use crate::error::{OasisError, Result};
use crate::timestamp::OasisTimestamp;

/// Low 5 bits of `fs_flags`: count of allocation-map sectors beyond sector 1.
pub const ADDITIONAL_AM_SECTORS_MASK: u8 = 0x1F;
/// High bit of `fs_flags`: write-protect.
pub const WRITE_PROTECT_BIT: u8 = 0x80;

pub const FSBLOCK_FIXED_LEN: usize = 32;
const DEBS_PER_SECTOR: usize = SECTOR_SIZE / DEB_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsBlock {
    pub label: [u8; 8],
    pub timestamp: OasisTimestamp,
    pub reserved12: [u8; 12],
    pub num_heads: u8,
    pub num_cyl: u8,
    pub num_sectors: u8,
    pub dir_entries_max: u8,
    pub reserved16: u16,
    pub free_blocks: u16,
    pub fs_flags: u8,
}

impl FsBlock {
    pub fn additional_am_sectors(&self) -> u8 {
        self.fs_flags & ADDITIONAL_AM_SECTORS_MASK
    }

    pub fn write_protected(&self) -> bool {
        self.fs_flags & WRITE_PROTECT_BIT != 0
    }

    pub fn set_write_protected(&mut self, protect: bool) {
        if protect {
            self.fs_flags |= WRITE_PROTECT_BIT;
        } else {
            self.fs_flags &= !WRITE_PROTECT_BIT;
        }
    }

    pub fn dir_sectors_max(&self) -> usize {
        self.dir_entries_max as usize / DEBS_PER_SECTOR
    }

    fn from_sector1_prefix(buf: &[u8]) -> Result<Self> {
        if buf.len() < FSBLOCK_FIXED_LEN {
            return Err(OasisError::format("sector 1 too short for filesystem block"));
        }
        let mut label = [0u8; 8];
        label.copy_from_slice(&buf[0..8]);
        let timestamp = OasisTimestamp::unpack([buf[8], buf[9], buf[10]]);
        let mut reserved12 = [0u8; 12];
        reserved12.copy_from_slice(&buf[11..23]);
        let num_heads = buf[23];
        let num_cyl = buf[24];
        let num_sectors = buf[25];
        let dir_entries_max = buf[26];
        let reserved16 = read_u16_le(buf, 27);
        let free_blocks = read_u16_le(buf, 29);
        let fs_flags = buf[31];
        Ok(FsBlock {
            label,
            timestamp,
            reserved12,
            num_heads,
            num_cyl,
            num_sectors,
            dir_entries_max,
            reserved16,
            free_blocks,
            fs_flags,
        })
    }

    fn to_sector1_prefix(&self) -> [u8; FSBLOCK_FIXED_LEN] {
        let mut buf = [0u8; FSBLOCK_FIXED_LEN];
        buf[0..8].copy_from_slice(&self.label);
        buf[8..11].copy_from_slice(&self.timestamp.pack());
        buf[11..23].copy_from_slice(&self.reserved12);
        buf[23] = self.num_heads;
        buf[24] = self.num_cyl;
        buf[25] = self.num_sectors;
        buf[26] = self.dir_entries_max;
        write_u16_le(&mut buf, 27, self.reserved16);
        write_u16_le(&mut buf, 29, self.free_blocks);
        buf[31] = self.fs_flags;
        buf
    }
}

pub struct DiskLayout {
    pub fsblock: FsBlock,
    pub alloc_map: AllocationMap,
    pub debs: Vec<Deb>,
}

impl DiskLayout {
    pub fn dir_start_lba(&self) -> u32 {
        2 + self.fsblock.additional_am_sectors() as u32
    }

    pub fn total_am_bytes(&self) -> usize {
        (SECTOR_SIZE - FSBLOCK_FIXED_LEN) + self.fsblock.additional_am_sectors() as usize * SECTOR_SIZE
    }

    pub fn load(container: &mut dyn SectorContainer) -> Result<Self> {
        let sector1 = container.read_sectors(1, 1)?;
        let fsblock = FsBlock::from_sector1_prefix(&sector1)?;

        let n = fsblock.additional_am_sectors() as u32;
        let mut am_bytes = Vec::with_capacity(fsblock.total_am_bytes_hint());
        am_bytes.extend_from_slice(&sector1[FSBLOCK_FIXED_LEN..]);
        if n > 0 {
            let extra = container.read_sectors(2, n)?;
            am_bytes.extend_from_slice(&extra);
        }

        let dir_sectors_max = fsblock.dir_sectors_max();
        if fsblock.dir_entries_max as usize * DEB_SIZE > dir_sectors_max * SECTOR_SIZE {
            return Err(OasisError::format(
                "dir_entries_max exceeds the space dir_sectors_max provides",
            ));
        }

        let capacity_blocks = am_bytes.len() * 8;
        if capacity_blocks as u64 > container.total_sectors() as u64 {
            // Not fatal by itself; the map may legitimately describe a
            // larger nominal geometry than the backing image.
        }
        let alloc_map = AllocationMap::from_bytes(am_bytes, capacity_blocks);

        let dir_start = 2 + n;
        let dir_raw = container.read_sectors(dir_start, dir_sectors_max as u32)?;
        let mut debs = Vec::with_capacity(fsblock.dir_entries_max as usize);
        for i in 0..fsblock.dir_entries_max as usize {
            let off = i * DEB_SIZE;
            if off + DEB_SIZE > dir_raw.len() {
                break;
            }
            debs.push(DebWire::from_bytes(&dir_raw[off..off + DEB_SIZE])?);
        }

        Ok(DiskLayout {
            fsblock,
            alloc_map,
            debs,
        })
    }

    pub fn save(&self, container: &mut dyn SectorContainer) -> Result<()> {
        let n = self.fsblock.additional_am_sectors() as usize;
        let am_bytes = self.alloc_map.as_bytes();

        let mut sector1 = vec![0u8; SECTOR_SIZE];
        sector1[..FSBLOCK_FIXED_LEN].copy_from_slice(&self.fsblock.to_sector1_prefix());
        let first_slice_len = (SECTOR_SIZE - FSBLOCK_FIXED_LEN).min(am_bytes.len());
        sector1[FSBLOCK_FIXED_LEN..FSBLOCK_FIXED_LEN + first_slice_len]
            .copy_from_slice(&am_bytes[..first_slice_len]);
        container.write_sectors(1, &sector1)?;

        if n > 0 {
            let mut rest = vec![0u8; n * SECTOR_SIZE];
            let remaining = &am_bytes[first_slice_len..];
            rest[..remaining.len()].copy_from_slice(remaining);
            container.write_sectors(2, &rest)?;
        }

        let dir_sectors_max = self.fsblock.dir_sectors_max();
        let mut dir_raw = vec![0u8; dir_sectors_max * SECTOR_SIZE];
        for (i, deb) in self.debs.iter().enumerate() {
            let off = i * DEB_SIZE;
            if off + DEB_SIZE > dir_raw.len() {
                break;
            }
            dir_raw[off..off + DEB_SIZE].copy_from_slice(&DebWire::to_bytes(deb));
        }
        container.write_sectors(2 + n as u32, &dir_raw)?;
        container.flush()
    }
}

impl FsBlock {
    fn total_am_bytes_hint(&self) -> usize {
        (SECTOR_SIZE - FSBLOCK_FIXED_LEN) + self.additional_am_sectors() as usize * SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deb::{FileFormat, FileOrganization};
    use crate::filename::OasisName;

    struct MemContainer {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl MemContainer {
        fn new(count: usize) -> Self {
            MemContainer {
                sectors: vec![[0u8; SECTOR_SIZE]; count],
            }
        }
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

    fn sample_layout() -> DiskLayout {
        let fsblock = FsBlock {
            label: *b"TESTDISK",
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            reserved12: [0u8; 12],
            num_heads: 1,
            num_cyl: 40,
            num_sectors: 26,
            dir_entries_max: 16,
            reserved16: 0,
            free_blocks: 100,
            fs_flags: 0,
        };
        let alloc_map = AllocationMap::new(200);
        let mut debs = vec![Deb::empty(); fsblock.dir_entries_max as usize];
        debs[0] = Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Sequential,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("FOO", "TXT").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 20,
            ffd1: 100,
            timestamp: OasisTimestamp::new(2, 2, 1980, 1, 1),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 20,
        };
        DiskLayout {
            fsblock,
            alloc_map,
            debs,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let layout = sample_layout();
        let mut container = MemContainer::new(64);
        layout.save(&mut container).unwrap();
        let loaded = DiskLayout::load(&mut container).unwrap();
        assert_eq!(loaded.fsblock, layout.fsblock);
        assert_eq!(loaded.debs[0], layout.debs[0]);
    }

    #[test]
    fn additional_am_sectors_round_trip_through_save_load() {
        let mut layout = sample_layout();
        layout.fsblock.fs_flags = 2; // 2 additional AM sectors
        layout.alloc_map = AllocationMap::new((256 - FSBLOCK_FIXED_LEN + 2 * 256) * 8);
        layout.alloc_map.set_state(500, true);
        let mut container = MemContainer::new(64);
        layout.save(&mut container).unwrap();
        let loaded = DiskLayout::load(&mut container).unwrap();
        assert!(loaded.alloc_map.get_state(500));
    }

    #[test]
    fn rejects_dir_entries_max_overflowing_dir_sectors() {
        let mut layout = sample_layout();
        layout.fsblock.dir_entries_max = 201; // 201/8 = 25 sectors, but 201*32 > 25*256
        layout.debs = vec![Deb::empty(); layout.fsblock.dir_entries_max as usize];
        let mut container = MemContainer::new(64);
        layout.save(&mut container).unwrap();
        assert!(DiskLayout::load(&mut container).is_err());
    }
}
