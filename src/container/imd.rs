//! ImageDisk (.IMD) container adapter.
//!
//! No ImageDisk-parsing crate is available in this workspace's dependency
//! stack, so the subset of the format needed to map OASIS LBAs to IMD
//! sector records is implemented here, kept behind the same
//! [`SectorContainer`] trait as the raw adapter so nothing above this
//! module knows the difference.

use super::SectorContainer;
use crate::endian::SECTOR_SIZE;
use crate::error::{OasisError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

const CYLINDER_MAP_FLAG: u8 = 0x80;
const HEAD_MAP_FLAG: u8 = 0x40;
const HEAD_MASK: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStatus {
    Good,
    HasError,
    Unavailable,
}

impl SectorStatus {
    fn from_record_type(t: u8) -> Result<(Self, bool)> {
        // (status, compressed)
        match t {
            0x00 => Ok((SectorStatus::Unavailable, false)),
            0x01 => Ok((SectorStatus::Good, false)),
            0x02 => Ok((SectorStatus::Good, true)),
            0x03 => Ok((SectorStatus::Good, false)),
            0x04 => Ok((SectorStatus::Good, true)),
            0x05 => Ok((SectorStatus::HasError, false)),
            0x06 => Ok((SectorStatus::HasError, true)),
            0x07 => Ok((SectorStatus::HasError, false)),
            0x08 => Ok((SectorStatus::HasError, true)),
            other => Err(OasisError::format(format!(
                "unknown IMD sector data record type {other:#x}"
            ))),
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(self, SectorStatus::HasError | SectorStatus::Unavailable)
    }
}

struct ImdSector {
    id: u8,
    size: usize,
    status: SectorStatus,
    data: Vec<u8>,
}

struct ImdTrack {
    mode: u8,
    cylinder: u8,
    head: u8,
    has_cylinder_map: bool,
    has_head_map: bool,
    sector_ids_file_order: Vec<u8>,
    cylinder_map: Vec<u8>,
    head_map: Vec<u8>,
    sectors_file_order: Vec<ImdSector>,
}

/// One OASIS LBA's worth of storage: either a single 256-byte IMD sector
/// or a pair of 128-byte IMD sectors (low half, high half).
enum LbaSlot {
    Single { track: usize, sector: usize },
    Pair { track: usize, low: usize, high: usize },
}

pub struct ImdContainer {
    header_comment: Vec<u8>,
    tracks: Vec<ImdTrack>,
    lba_map: Vec<LbaSlot>,
    path: std::path::PathBuf,
    writable: bool,
    dirty: bool,
}

impl ImdContainer {
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let header_end = raw
            .iter()
            .position(|&b| b == 0x1A)
            .ok_or_else(|| OasisError::format("IMD header missing 0x1A terminator"))?;
        let header_comment = raw[..header_end].to_vec();
        let mut cursor = header_end + 1;

        let mut tracks = Vec::new();
        while cursor < raw.len() {
            let track = Self::parse_track(&raw, &mut cursor)?;
            tracks.push(track);
        }

        validate_tracks(&tracks)?;
        let lba_map = build_lba_map(&tracks)?;

        Ok(ImdContainer {
            header_comment,
            tracks,
            lba_map,
            path: path.to_path_buf(),
            writable,
            dirty: false,
        })
    }

    fn parse_track(raw: &[u8], cursor: &mut usize) -> Result<ImdTrack> {
        let need = |c: usize, n: usize| -> Result<()> {
            if c + n > raw.len() {
                Err(OasisError::format("truncated IMD track header"))
            } else {
                Ok(())
            }
        };
        need(*cursor, 5)?;
        let mode = raw[*cursor];
        let cylinder = raw[*cursor + 1];
        let head_byte = raw[*cursor + 2];
        let num_sectors = raw[*cursor + 3] as usize;
        let size_code = raw[*cursor + 4];
        *cursor += 5;

        let size = match size_code {
            0 => 128,
            1 => 256,
            other => {
                return Err(OasisError::format(format!(
                    "unsupported IMD sector size code {other}"
                )))
            }
        };

        need(*cursor, num_sectors)?;
        let sector_ids_file_order = raw[*cursor..*cursor + num_sectors].to_vec();
        *cursor += num_sectors;

        let has_cylinder_map = head_byte & CYLINDER_MAP_FLAG != 0;
        let cylinder_map = if has_cylinder_map {
            need(*cursor, num_sectors)?;
            let m = raw[*cursor..*cursor + num_sectors].to_vec();
            *cursor += num_sectors;
            m
        } else {
            Vec::new()
        };

        let has_head_map = head_byte & HEAD_MAP_FLAG != 0;
        let head_map = if has_head_map {
            need(*cursor, num_sectors)?;
            let m = raw[*cursor..*cursor + num_sectors].to_vec();
            *cursor += num_sectors;
            m
        } else {
            Vec::new()
        };

        let mut sectors_file_order = Vec::with_capacity(num_sectors);
        for &id in &sector_ids_file_order {
            need(*cursor, 1)?;
            let record_type = raw[*cursor];
            *cursor += 1;
            let (status, compressed) = SectorStatus::from_record_type(record_type)?;
            let data = if status == SectorStatus::Unavailable {
                vec![0u8; size]
            } else if compressed {
                need(*cursor, 1)?;
                let fill = raw[*cursor];
                *cursor += 1;
                vec![fill; size]
            } else {
                need(*cursor, size)?;
                let d = raw[*cursor..*cursor + size].to_vec();
                *cursor += size;
                d
            };
            sectors_file_order.push(ImdSector {
                id,
                size,
                status,
                data,
            });
        }

        Ok(ImdTrack {
            mode,
            cylinder,
            head: head_byte & HEAD_MASK,
            has_cylinder_map,
            has_head_map,
            sector_ids_file_order,
            cylinder_map,
            head_map,
            sectors_file_order,
        })
    }
}

fn validate_tracks(tracks: &[ImdTrack]) -> Result<()> {
    for (t_idx, track) in tracks.iter().enumerate() {
        let mut ascending: Vec<&ImdSector> = track.sectors_file_order.iter().collect();
        ascending.sort_by_key(|s| s.id);

        let mut seen_256 = false;
        let mut count_128 = 0usize;
        for sector in &ascending {
            if sector.size == 128 {
                if seen_256 {
                    return Err(OasisError::format(format!(
                        "track {t_idx}: 128-byte sector follows a 256-byte sector"
                    )));
                }
                count_128 += 1;
            } else {
                seen_256 = true;
            }
        }
        if count_128 % 2 != 0 {
            return Err(OasisError::format(format!(
                "track {t_idx}: odd number of 128-byte sectors ({count_128})"
            )));
        }
    }
    Ok(())
}

fn build_lba_map(tracks: &[ImdTrack]) -> Result<Vec<LbaSlot>> {
    let mut map = Vec::new();
    for (t_idx, track) in tracks.iter().enumerate() {
        let mut ascending: Vec<usize> = (0..track.sectors_file_order.len()).collect();
        ascending.sort_by_key(|&i| track.sectors_file_order[i].id);

        let mut i = 0;
        while i < ascending.len() {
            let idx = ascending[i];
            if track.sectors_file_order[idx].size == 256 {
                map.push(LbaSlot::Single {
                    track: t_idx,
                    sector: idx,
                });
                i += 1;
            } else {
                if i + 1 >= ascending.len() {
                    return Err(OasisError::format(format!(
                        "track {t_idx}: unpaired 128-byte sector"
                    )));
                }
                let low = idx;
                let high = ascending[i + 1];
                map.push(LbaSlot::Pair {
                    track: t_idx,
                    low,
                    high,
                });
                i += 2;
            }
        }
    }
    Ok(map)
}

impl ImdContainer {
    /// Bad sectors on the image, as (LBA, status), for the consistency
    /// checker's cross-reference pass.
    pub fn bad_sectors(&self) -> Vec<(u32, SectorStatus)> {
        let mut out = Vec::new();
        for (lba, slot) in self.lba_map.iter().enumerate() {
            let bad = match slot {
                LbaSlot::Single { track, sector } => {
                    self.tracks[*track].sectors_file_order[*sector].status
                }
                LbaSlot::Pair { track, low, high } => {
                    let lo = self.tracks[*track].sectors_file_order[*low].status;
                    let hi = self.tracks[*track].sectors_file_order[*high].status;
                    if lo.is_bad() {
                        lo
                    } else {
                        hi
                    }
                }
            };
            if bad.is_bad() {
                out.push((lba as u32, bad));
            }
        }
        out
    }
}

impl SectorContainer for ImdContainer {
    fn total_sectors(&self) -> u32 {
        self.lba_map.len() as u32
    }

    fn read_sectors(&mut self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * SECTOR_SIZE);
        for i in 0..count {
            let idx = (lba + i) as usize;
            let Some(slot) = self.lba_map.get(idx) else {
                out.extend(std::iter::repeat(0u8).take(SECTOR_SIZE));
                continue;
            };
            match slot {
                LbaSlot::Single { track, sector } => {
                    let s = &self.tracks[*track].sectors_file_order[*sector];
                    if s.status.is_bad() {
                        out.extend(std::iter::repeat(0u8).take(SECTOR_SIZE));
                    } else {
                        out.extend_from_slice(&s.data);
                    }
                }
                LbaSlot::Pair { track, low, high } => {
                    let lo = &self.tracks[*track].sectors_file_order[*low];
                    let hi = &self.tracks[*track].sectors_file_order[*high];
                    if lo.status.is_bad() || hi.status.is_bad() {
                        out.extend(std::iter::repeat(0u8).take(SECTOR_SIZE));
                    } else {
                        out.extend_from_slice(&lo.data);
                        out.extend_from_slice(&hi.data);
                    }
                }
            }
        }
        Ok(out)
    }

    fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(OasisError::invalid_argument("container opened read-only"));
        }
        super::check_sector_aligned(data)?;
        let count = data.len() / SECTOR_SIZE;
        for i in 0..count {
            let idx = lba as usize + i;
            let chunk = &data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            let slot = self
                .lba_map
                .get(idx)
                .ok_or_else(|| OasisError::invalid_argument(format!("LBA {idx} out of range")))?;
            match slot {
                LbaSlot::Single { track, sector } => {
                    self.tracks[*track].sectors_file_order[*sector].data = chunk.to_vec();
                }
                LbaSlot::Pair { track, low, high } => {
                    self.tracks[*track].sectors_file_order[*low].data = chunk[..128].to_vec();
                    self.tracks[*track].sectors_file_order[*high].data = chunk[128..].to_vec();
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Clears every sector's error/unavailable flag and zeroes its data,
    /// the IMD-specific counterpart of a raw image's no-op blank.
    fn blank(&mut self) -> Result<()> {
        if !self.writable {
            return Err(OasisError::invalid_argument("container opened read-only"));
        }
        for track in &mut self.tracks {
            for sector in &mut track.sectors_file_order {
                sector.status = SectorStatus::Good;
                sector.data = vec![0u8; sector.size];
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut out = Vec::new();
        out.extend_from_slice(&self.header_comment);
        out.push(0x1A);
        for track in &self.tracks {
            out.push(track.mode);
            out.push(track.cylinder);
            let mut head_byte = track.head & HEAD_MASK;
            if track.has_cylinder_map {
                head_byte |= CYLINDER_MAP_FLAG;
            }
            if track.has_head_map {
                head_byte |= HEAD_MAP_FLAG;
            }
            out.push(head_byte);
            out.push(track.sector_ids_file_order.len() as u8);
            let size_code = match track.sectors_file_order.first().map(|s| s.size) {
                Some(128) => 0u8,
                _ => 1u8,
            };
            out.push(size_code);
            out.extend_from_slice(&track.sector_ids_file_order);
            if track.has_cylinder_map {
                out.extend_from_slice(&track.cylinder_map);
            }
            if track.has_head_map {
                out.extend_from_slice(&track.head_map);
            }
            for sector in &track.sectors_file_order {
                match sector.status {
                    SectorStatus::Unavailable => out.push(0x00),
                    SectorStatus::Good => {
                        out.push(0x01);
                        out.extend_from_slice(&sector.data);
                    }
                    SectorStatus::HasError => {
                        out.push(0x05);
                        out.extend_from_slice(&sector.data);
                    }
                }
            }
        }
        let mut file = File::create(&self.path)?;
        file.write_all(&out)?;
        self.dirty = false;
        Ok(())
    }
}
