//! Disk initializer: `initdisk` operations.
//!
//! FORMAT, BUILD, CLEAR, LABEL and WP/NOWP compose the same primitives the
//! writer uses (allocation map, disk layout): a fresh [`DiskLayout`] is
//! built in memory and flushed through [`DiskLayout::save`].
//!
//! FORMAT and BUILD differ in how much they trust the medium: FORMAT asks
//! the container to blank itself and then constructs a brand new fsblock,
//! allocation map and empty directory for the requested geometry. BUILD
//! assumes the container already holds a valid, formatted layout and just
//! rewrites that same layout's filesystem surfaces, leaving its allocation
//! map and directory contents untouched.

use crate::alloc_map::AllocationMap;
use crate::container::SectorContainer;
use crate::deb::Deb;
use crate::error::{OasisError, Result};
use crate::layout::{DiskLayout, FsBlock};
use crate::timestamp::OasisTimestamp;

#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub num_heads: u8,
    pub num_cyl: u8,
    pub num_sectors: u8,
    pub dir_entries_max: u8,
    pub additional_am_sectors: u8,
}

impl Geometry {
    fn capacity_blocks(&self) -> usize {
        let am_bytes = (256 - crate::layout::FSBLOCK_FIXED_LEN)
            + self.additional_am_sectors as usize * 256;
        am_bytes * 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryOp {
    Format(Geometry),
    Build,
    Clear,
}

#[derive(Debug, Default, Clone)]
pub struct InitRequest {
    pub primary: Option<PrimaryOp>,
    pub label: Option<[u8; 8]>,
    pub write_protect: Option<bool>,
}

fn blank_layout(geometry: Geometry) -> DiskLayout {
    let dir_entries_max = geometry.dir_entries_max;
    DiskLayout {
        fsblock: FsBlock {
            label: *b"        ",
            timestamp: OasisTimestamp::new(1, 1, 1977, 0, 0),
            reserved12: [0; 12],
            num_heads: geometry.num_heads,
            num_cyl: geometry.num_cyl,
            num_sectors: geometry.num_sectors,
            dir_entries_max,
            reserved16: 0,
            free_blocks: geometry.capacity_blocks() as u16,
            fs_flags: geometry.additional_am_sectors,
        },
        alloc_map: AllocationMap::new(geometry.capacity_blocks()),
        debs: vec![Deb::empty(); dir_entries_max as usize],
    }
}

/// Runs `req` against `container`, returning the resulting layout so the
/// caller can inspect or further mutate it before the process exits.
///
/// Conflict rules (enforced by the CLI layer, not here): at most one of
/// FORMAT/CLEAR/BUILD per invocation; `write_protect`/`label` compose with
/// any primary op.
pub fn run(container: &mut dyn SectorContainer, req: &InitRequest, existing: Option<DiskLayout>) -> Result<DiskLayout> {
    let mut layout = match &req.primary {
        Some(PrimaryOp::Format(geometry)) => {
            container.blank()?;
            blank_layout(*geometry)
        }
        Some(PrimaryOp::Build) => existing.ok_or_else(|| {
            OasisError::invalid_argument("BUILD requires an existing, loaded disk layout")
        })?,
        Some(PrimaryOp::Clear) => {
            let mut layout = existing.ok_or_else(|| {
                OasisError::invalid_argument("CLEAR requires an existing, loaded disk layout")
            })?;
            let capacity = layout.alloc_map.capacity();
            layout.alloc_map = AllocationMap::new(capacity);
            for deb in layout.debs.iter_mut() {
                *deb = Deb::empty();
            }
            layout.fsblock.free_blocks = capacity as u16;
            layout
        }
        None => existing.ok_or_else(|| {
            OasisError::invalid_argument("LABEL/WP require an existing, loaded disk layout")
        })?,
    };

    if let Some(label) = req.label {
        layout.fsblock.label = label;
    }
    if let Some(wp) = req.write_protect {
        layout.fsblock.set_write_protected(wp);
    }

    layout.save(container)?;
    Ok(layout)
}
