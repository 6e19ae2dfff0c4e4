//! Directory Entry Block model.
//!
//! On-disk DEBs are decoded into [`Deb`], a host-order structure with a
//! tagged [`FileFormat`] in place of the raw byte's bit-twiddling.
//! [`DebWire`] is the 32-byte wire form; all endian swapping happens in its
//! `from_bytes`/`to_bytes`, nowhere else.

use crate::endian::{read_u16_le, write_u16_le};
use crate::error::{OasisError, Result};
use crate::filename::OasisName;
use crate::timestamp::OasisTimestamp;

pub const DEB_SIZE: usize = 32;
pub const FILE_FORMAT_MASK: u8 = 0x1F;
pub const SYNONYM_BIT: u8 = 0x80;
pub const EMPTY_MARKER: u8 = 0x00;
pub const DELETED_MARKER: u8 = 0xFF;

/// Low 5 bits of `file_format` for a non-empty, non-deleted, non-synonym
/// entry, naming the storage organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOrganization {
    Relocatable = 0x01,
    Absolute = 0x02,
    Sequential = 0x04,
    Direct = 0x08,
    Indexed = 0x10,
    Keyed = 0x18,
}

impl FileOrganization {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x01 => Some(FileOrganization::Relocatable),
            0x02 => Some(FileOrganization::Absolute),
            0x04 => Some(FileOrganization::Sequential),
            0x08 => Some(FileOrganization::Direct),
            0x10 => Some(FileOrganization::Indexed),
            0x18 => Some(FileOrganization::Keyed),
            _ => None,
        }
    }

    pub fn is_contiguous(self) -> bool {
        !matches!(self, FileOrganization::Sequential)
    }

    /// Maps the `_FMT` suffix character from the extended host filename
    /// convention (`R`/`A`/`S`/`D`/`I`/`K`) to an organization.
    pub fn from_suffix_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'R' => Some(FileOrganization::Relocatable),
            'A' => Some(FileOrganization::Absolute),
            'S' => Some(FileOrganization::Sequential),
            'D' => Some(FileOrganization::Direct),
            'I' => Some(FileOrganization::Indexed),
            'K' => Some(FileOrganization::Keyed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Empty,
    Deleted,
    /// High bit set in the raw byte; semantics beyond "this is a synonym"
    /// are not modeled, so the raw byte is retained for faithful re-encoding.
    Synonym(u8),
    Regular {
        organization: FileOrganization,
        attributes: u8,
    },
}

impl FileFormat {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            EMPTY_MARKER => Ok(FileFormat::Empty),
            DELETED_MARKER => Ok(FileFormat::Deleted),
            b if b & SYNONYM_BIT != 0 => Ok(FileFormat::Synonym(b)),
            b => {
                let organization = FileOrganization::from_bits(b & FILE_FORMAT_MASK)
                    .ok_or_else(|| {
                        OasisError::format(format!("unknown file organization bits {:#x}", b & FILE_FORMAT_MASK))
                    })?;
                Ok(FileFormat::Regular {
                    organization,
                    attributes: b & !FILE_FORMAT_MASK,
                })
            }
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FileFormat::Empty => EMPTY_MARKER,
            FileFormat::Deleted => DELETED_MARKER,
            FileFormat::Synonym(b) => b,
            FileFormat::Regular {
                organization,
                attributes,
            } => (organization as u8) | (attributes & !FILE_FORMAT_MASK),
        }
    }

    pub fn is_valid_entry(self) -> bool {
        !matches!(self, FileFormat::Empty | FileFormat::Deleted)
    }

    pub fn organization(self) -> Option<FileOrganization> {
        match self {
            FileFormat::Regular { organization, .. } => Some(organization),
            _ => None,
        }
    }
}

/// The alternate Indexed/Keyed FFD1 metadata shift documented but not used
/// in different copies of the original reference image's source commentary.
/// This crate uses [`FFD1_METADATA_SHIFT`] and keeps this constant only so
/// the discrepancy is visible to a future maintainer.
pub const FFD1_METADATA_SHIFT: u32 = 5;
#[allow(dead_code)]
pub const FFD1_ALT_METADATA_SHIFT: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deb {
    pub file_format: FileFormat,
    pub oasis_name: OasisName,
    pub record_count: u16,
    pub block_count: u16,
    pub start_sector: u16,
    pub ffd1: u16,
    pub timestamp: OasisTimestamp,
    pub owner_id: u8,
    pub shared_from_owner_id: u8,
    pub ffd2: u16,
}

impl Deb {
    pub fn empty() -> Self {
        Deb {
            file_format: FileFormat::Empty,
            oasis_name: OasisName::from_fields("", "").unwrap(),
            record_count: 0,
            block_count: 0,
            start_sector: 0,
            ffd1: 0,
            timestamp: OasisTimestamp::new(1, 1, 1977, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        }
    }

    pub fn is_empty_slot(&self) -> bool {
        matches!(self.file_format, FileFormat::Empty | FileFormat::Deleted)
    }

    /// Sequential: longest record length. Direct/Indexed/Keyed: record
    /// length / key length bits. Absolute/Relocatable: record length.
    pub fn key_length(&self) -> u16 {
        (self.ffd1 as u32 & ((1 << FFD1_METADATA_SHIFT) - 1)) as u16
    }

    pub fn allocated_record_metadata(&self) -> u16 {
        (self.ffd1 as u32 >> FFD1_METADATA_SHIFT) as u16
    }

    /// Structural invariants independent of the allocation map or directory
    /// context (cross-file checks live in the consistency checker).
    pub fn validate_structure(&self, total_sectors: u32) -> Result<()> {
        if !self.file_format.is_valid_entry() {
            return Ok(());
        }
        if self.block_count > 0 && self.start_sector == 0 {
            return Err(OasisError::inconsistent(
                "block_count > 0 but start_sector is 0",
            ));
        }
        let end = self.start_sector as u64 + self.block_count as u64 * 4;
        if end > total_sectors as u64 {
            return Err(OasisError::inconsistent(format!(
                "DEB extends to sector {end}, beyond disk capacity {total_sectors}"
            )));
        }
        self.timestamp.validate()?;
        Ok(())
    }
}

/// 32-byte on-disk form of a DEB. All field access goes through
/// [`from_bytes`](DebWire::from_bytes) / [`to_bytes`](DebWire::to_bytes).
pub struct DebWire;

impl DebWire {
    pub fn from_bytes(buf: &[u8]) -> Result<Deb> {
        if buf.len() < DEB_SIZE {
            return Err(OasisError::format(format!(
                "DEB buffer too small: {} bytes",
                buf.len()
            )));
        }
        let file_format = FileFormat::from_byte(buf[0])?;
        let mut name = [0u8; 8];
        name.copy_from_slice(&buf[1..9]);
        let mut file_type = [0u8; 8];
        file_type.copy_from_slice(&buf[9..17]);
        let record_count = read_u16_le(buf, 17);
        let block_count = read_u16_le(buf, 19);
        let start_sector = read_u16_le(buf, 21);
        let ffd1 = read_u16_le(buf, 23);
        let timestamp = OasisTimestamp::unpack([buf[25], buf[26], buf[27]]);
        let owner_id = buf[28];
        let shared_from_owner_id = buf[29];
        let ffd2 = read_u16_le(buf, 30);

        Ok(Deb {
            file_format,
            oasis_name: OasisName { name, file_type },
            record_count,
            block_count,
            start_sector,
            ffd1,
            timestamp,
            owner_id,
            shared_from_owner_id,
            ffd2,
        })
    }

    pub fn to_bytes(deb: &Deb) -> [u8; DEB_SIZE] {
        let mut buf = [0u8; DEB_SIZE];
        buf[0] = deb.file_format.to_byte();
        buf[1..9].copy_from_slice(&deb.oasis_name.name);
        buf[9..17].copy_from_slice(&deb.oasis_name.file_type);
        write_u16_le(&mut buf, 17, deb.record_count);
        write_u16_le(&mut buf, 19, deb.block_count);
        write_u16_le(&mut buf, 21, deb.start_sector);
        write_u16_le(&mut buf, 23, deb.ffd1);
        let packed = deb.timestamp.pack();
        buf[25..28].copy_from_slice(&packed);
        buf[28] = deb.owner_id;
        buf[29] = deb.shared_from_owner_id;
        write_u16_le(&mut buf, 30, deb.ffd2);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_deb() -> Deb {
        Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Sequential,
                attributes: 0x20,
            },
            oasis_name: OasisName::from_fields("HELLO", "TXT").unwrap(),
            record_count: 12,
            block_count: 3,
            start_sector: 40,
            ffd1: 80,
            timestamp: OasisTimestamp::new(4, 23, 1985, 14, 30),
            owner_id: 1,
            shared_from_owner_id: 0,
            ffd2: 61,
        }
    }

    #[test]
    fn deb_round_trip() {
        let deb = sample_deb();
        let wire = DebWire::to_bytes(&deb);
        let back = DebWire::from_bytes(&wire).unwrap();
        assert_eq!(back, deb);
    }

    #[test]
    fn file_format_round_trip_for_each_organization() {
        for bits in [0x01u8, 0x02, 0x04, 0x08, 0x10, 0x18] {
            let byte = bits | 0x40;
            let fmt = FileFormat::from_byte(byte).unwrap();
            assert_eq!(fmt.to_byte(), byte);
        }
    }

    #[test]
    fn empty_and_deleted_markers() {
        assert_eq!(FileFormat::from_byte(0x00).unwrap(), FileFormat::Empty);
        assert_eq!(FileFormat::from_byte(0xFF).unwrap(), FileFormat::Deleted);
    }

    #[test]
    fn synonym_bit_takes_priority() {
        let fmt = FileFormat::from_byte(0x81).unwrap();
        assert!(matches!(fmt, FileFormat::Synonym(0x81)));
    }

    #[test]
    fn unknown_organization_bits_error() {
        assert!(FileFormat::from_byte(0x03).is_err());
    }

    #[test]
    fn organization_from_suffix_char_covers_all_letters() {
        assert_eq!(FileOrganization::from_suffix_char('r'), Some(FileOrganization::Relocatable));
        assert_eq!(FileOrganization::from_suffix_char('A'), Some(FileOrganization::Absolute));
        assert_eq!(FileOrganization::from_suffix_char('S'), Some(FileOrganization::Sequential));
        assert_eq!(FileOrganization::from_suffix_char('D'), Some(FileOrganization::Direct));
        assert_eq!(FileOrganization::from_suffix_char('I'), Some(FileOrganization::Indexed));
        assert_eq!(FileOrganization::from_suffix_char('K'), Some(FileOrganization::Keyed));
        assert_eq!(FileOrganization::from_suffix_char('X'), None);
    }

    #[test]
    fn block_count_without_start_sector_is_invalid() {
        let mut deb = sample_deb();
        deb.start_sector = 0;
        deb.block_count = 2;
        assert!(deb.validate_structure(10_000).is_err());
    }

    #[test]
    fn deb_beyond_disk_capacity_is_invalid() {
        let mut deb = sample_deb();
        deb.start_sector = 9_990;
        deb.block_count = 10;
        assert!(deb.validate_structure(10_000).is_err());
    }
}
