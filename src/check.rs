//! Consistency checker. Read-only: accumulates findings, never mutates the
//! layout.

use crate::alloc_map::AllocationMap;
use crate::container::imd::{ImdContainer, SectorStatus};
use crate::deb::Deb;
use crate::endian::SECTORS_PER_BLOCK;
use crate::filename::wildcard_match;
use crate::layout::DiskLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub files_checked: usize,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn error_count(&self) -> usize {
        self.findings.iter().filter(|f| f.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.findings.iter().filter(|f| f.severity == Severity::Warning).count()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Error,
            message: msg.into(),
        });
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Warning,
            message: msg.into(),
        });
    }
}

/// Runs the full consistency pass. `total_physical_sectors` is the
/// container's actual capacity; `bad_sectors` comes from the IMD adapter
/// when the image is an IMD container (empty for raw images).
pub fn check(
    layout: &DiskLayout,
    total_physical_sectors: u32,
    bad_sectors: &[(u32, SectorStatus)],
    name_filter: Option<&str>,
) -> CheckReport {
    let mut report = CheckReport::default();
    let capacity_blocks = layout.alloc_map.capacity();
    let mut claimed: Vec<Option<String>> = vec![None; capacity_blocks * SECTORS_PER_BLOCK];

    let dir_start = layout.dir_start_lba();
    let dir_len = layout.fsblock.dir_sectors_max() as u32;
    mark_system_sector(&mut claimed, 0, "boot sector");
    mark_system_sector(&mut claimed, 1, "filesystem block / allocation map");
    for lba in 2..dir_start {
        mark_system_sector(&mut claimed, lba, "additional allocation-map sector");
    }
    for lba in dir_start..dir_start + dir_len {
        mark_system_sector(&mut claimed, lba, "directory");
    }
    for lba in total_physical_sectors as usize..claimed.len() {
        claimed[lba] = Some("beyond physical disk capacity".to_string());
    }

    let bad_lbas: std::collections::HashSet<u32> = bad_sectors.iter().map(|(lba, _)| *lba).collect();

    for deb in &layout.debs {
        if !deb.file_format.is_valid_entry() {
            continue;
        }
        let host_name = deb.oasis_name.to_host_string();
        if let Some(pattern) = name_filter {
            if !wildcard_match(pattern, &host_name) {
                continue;
            }
        }
        report.files_checked += 1;
        check_one_file(
            &mut report,
            deb,
            &host_name,
            total_physical_sectors,
            &layout.alloc_map,
            &mut claimed,
            &bad_lbas,
        );
    }

    for block in orphan_blocks(layout, total_physical_sectors, &claimed) {
        report.warn(format!("block {block} is allocated but claimed by no file or system area (orphan)"));
    }

    report
}

/// Blocks the allocation map marks allocated but that no file or system
/// area claims. Shared by [`check`]'s warning pass and [`fix_orphans`],
/// which clears exactly these bits.
fn orphan_blocks(layout: &DiskLayout, total_physical_sectors: u32, claimed: &[Option<String>]) -> Vec<usize> {
    let capacity_blocks = layout.alloc_map.capacity();
    (0..capacity_blocks)
        .filter(|&block| {
            if !layout.alloc_map.get_state(block) {
                return false;
            }
            let base = block * SECTORS_PER_BLOCK;
            if base + SECTORS_PER_BLOCK > total_physical_sectors as usize {
                return false;
            }
            (base..base + SECTORS_PER_BLOCK).all(|lba| claimed[lba].is_none())
        })
        .collect()
}

/// Recomputes the same claimed-sector map `check` builds, then clears every
/// orphan block's allocation-map bit. A repair complement to the read-only
/// checker, off by default in the CLI.
pub fn fix_orphans(layout: &mut DiskLayout, total_physical_sectors: u32) -> usize {
    let capacity_blocks = layout.alloc_map.capacity();
    let mut claimed: Vec<Option<String>> = vec![None; capacity_blocks * SECTORS_PER_BLOCK];

    let dir_start = layout.dir_start_lba();
    let dir_len = layout.fsblock.dir_sectors_max() as u32;
    mark_system_sector(&mut claimed, 0, "boot sector");
    mark_system_sector(&mut claimed, 1, "filesystem block / allocation map");
    for lba in 2..dir_start {
        mark_system_sector(&mut claimed, lba, "additional allocation-map sector");
    }
    for lba in dir_start..dir_start + dir_len {
        mark_system_sector(&mut claimed, lba, "directory");
    }

    for deb in &layout.debs {
        if !deb.file_format.is_valid_entry() {
            continue;
        }
        let sectors = match deb.file_format.organization() {
            Some(crate::deb::FileOrganization::Sequential) => {
                if deb.start_sector == 0 { Vec::new() } else { vec![deb.start_sector as u32] }
            }
            _ => {
                let start = deb.start_sector as u32;
                let end = start + deb.block_count as u32 * SECTORS_PER_BLOCK as u32;
                (start..end).collect()
            }
        };
        for lba in sectors {
            if let Some(slot) = claimed.get_mut(lba as usize) {
                *slot = Some(deb.oasis_name.to_host_string());
            }
        }
    }

    let orphans = orphan_blocks(layout, total_physical_sectors, &claimed);
    for block in &orphans {
        let _ = layout.alloc_map.deallocate(*block, 1);
    }
    layout.fsblock.free_blocks = layout.fsblock.free_blocks.saturating_add(orphans.len() as u16);
    orphans.len()
}

fn mark_system_sector(claimed: &mut [Option<String>], lba: u32, label: &str) {
    if let Some(slot) = claimed.get_mut(lba as usize) {
        *slot = Some(label.to_string());
    }
}

fn check_one_file(
    report: &mut CheckReport,
    deb: &Deb,
    host_name: &str,
    total_physical_sectors: u32,
    alloc_map: &AllocationMap,
    claimed: &mut [Option<String>],
    bad_lbas: &std::collections::HashSet<u32>,
) {
    if deb.block_count as u32 > total_physical_sectors / SECTORS_PER_BLOCK as u32 {
        report.error(format!("{host_name}: block_count {} exceeds disk capacity", deb.block_count));
    }
    if deb.start_sector == 0 && deb.block_count > 0 {
        report.warn(format!("{host_name}: start_sector is 0 with nonzero block_count"));
    }
    let map_sector_capacity = claimed.len() as u32;
    if deb.start_sector > 0 && deb.start_sector as u32 >= map_sector_capacity {
        report.error(format!(
            "{host_name}: start_sector {} is outside the allocation map's tracked range ({map_sector_capacity} sectors)",
            deb.start_sector
        ));
    }
    if let Err(e) = deb.timestamp.validate() {
        report.warn(format!("{host_name}: timestamp out of range: {e}"));
    }

    let sectors = match deb.file_format.organization() {
        Some(crate::deb::FileOrganization::Sequential) => walk_chain_for_check(report, deb, host_name),
        _ => {
            let start = deb.start_sector as u32;
            let end = start + deb.block_count as u32 * SECTORS_PER_BLOCK as u32;
            (start..end).collect()
        }
    };

    let mut unallocated_blocks_reported = std::collections::HashSet::new();
    for lba in &sectors {
        if let Some(slot) = claimed.get_mut(*lba as usize) {
            match slot {
                Some(owner) => {
                    report.error(format!("{host_name}: sector {lba} already claimed by {owner}"));
                }
                None => *slot = Some(host_name.to_string()),
            }
        }
        if bad_lbas.contains(lba) {
            report.error(format!("{host_name}: uses bad sector {lba}"));
        }

        let block = *lba as usize / SECTORS_PER_BLOCK;
        if block < alloc_map.capacity()
            && !alloc_map.get_state(block)
            && unallocated_blocks_reported.insert(block)
        {
            report.error(format!(
                "{host_name}: sector {lba} falls in block {block}, which the allocation map does not mark allocated"
            ));
        }
    }
}

/// Claims only the chain's start LBA: this container-free pass cannot
/// follow the chain's links (they live in the sector data itself). The
/// full walk, cycle detection and FFD2 terminal check happen in
/// [`check_with_container`], which has a container handle to read with.
fn walk_chain_for_check(_report: &mut CheckReport, deb: &Deb, _host_name: &str) -> Vec<u32> {
    if deb.start_sector == 0 {
        Vec::new()
    } else {
        vec![deb.start_sector as u32]
    }
}

/// Overload taking an open container, so the sequential chain walk and the
/// IMD bad-sector scan can see live data.
pub fn check_with_container(
    layout: &DiskLayout,
    container: &mut dyn crate::container::SectorContainer,
    imd: Option<&ImdContainer>,
    name_filter: Option<&str>,
) -> CheckReport {
    let total = container.total_sectors();
    let bad = imd.map(|c| c.bad_sectors()).unwrap_or_default();
    let mut report = check(layout, total, &bad, name_filter);

    // Replace the approximate sequential walk with a container-backed one.
    for deb in layout.debs.iter().filter(|d| {
        d.file_format.is_valid_entry()
            && d.file_format.organization() == Some(crate::deb::FileOrganization::Sequential)
    }) {
        let host_name = deb.oasis_name.to_host_string();
        if let Some(pattern) = name_filter {
            if !wildcard_match(pattern, &host_name) {
                continue;
            }
        }
        if let Err(e) = crate::reader::read_file(container, deb) {
            report.error(format!("{host_name}: sequential chain walk failed: {e}"));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_map::AllocationMap;
    use crate::deb::{FileFormat, FileOrganization};
    use crate::filename::OasisName;
    use crate::layout::FsBlock;
    use crate::timestamp::OasisTimestamp;

    fn base_layout() -> DiskLayout {
        DiskLayout {
            fsblock: FsBlock {
                label: *b"TEST    ",
                timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
                reserved12: [0; 12],
                num_heads: 1,
                num_cyl: 77,
                num_sectors: 26,
                dir_entries_max: 16,
                reserved16: 0,
                free_blocks: 90,
                fs_flags: 0,
            },
            alloc_map: AllocationMap::new(100),
            debs: vec![Deb::empty(); 16],
        }
    }

    #[test]
    fn flags_orphan_block() {
        let mut layout = base_layout();
        layout.alloc_map.set_state(50, true);
        let report = check(&layout, 4000, &[], None);
        assert!(report.findings.iter().any(|f| f.message.contains("orphan")));
    }

    #[test]
    fn flags_shared_sector_between_two_files() {
        let mut layout = base_layout();
        layout.alloc_map.set_state(10, true);
        layout.debs[0] = Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Direct,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("A", "A").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 40,
            ffd1: 1,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        };
        layout.debs[1] = Deb {
            oasis_name: OasisName::from_fields("B", "B").unwrap(),
            ..layout.debs[0]
        };
        let report = check(&layout, 4000, &[], None);
        assert_eq!(report.files_checked, 2);
        assert!(report.error_count() >= 1);
    }

    #[test]
    fn bad_sector_cross_reference_flags_file() {
        let mut layout = base_layout();
        layout.alloc_map.set_state(10, true);
        layout.debs[0] = Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Direct,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("A", "A").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 40,
            ffd1: 1,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        };
        let report = check(&layout, 4000, &[(40, SectorStatus::HasError)], None);
        assert!(report.findings.iter().any(|f| f.message.contains("bad sector")));
    }

    #[test]
    fn start_sector_outside_map_bounds_is_flagged() {
        // base_layout's map tracks 100 blocks = 400 sectors; a DEB starting
        // past that is out of the map's range even though it's well within
        // a larger physical disk (total_physical_sectors below).
        let mut layout = base_layout();
        layout.debs[0] = Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Direct,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("A", "A").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 404,
            ffd1: 1,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        };
        let report = check(&layout, 3000, &[], None);
        assert!(report
            .findings
            .iter()
            .any(|f| f.message.contains("outside the allocation map's tracked range")));
    }

    #[test]
    fn claimed_sector_in_unallocated_block_is_flagged() {
        let mut layout = base_layout();
        // start_sector 40 is block 10; deliberately leave the allocation
        // map's bit for block 10 clear.
        layout.debs[0] = Deb {
            file_format: FileFormat::Regular {
                organization: FileOrganization::Direct,
                attributes: 0,
            },
            oasis_name: OasisName::from_fields("A", "A").unwrap(),
            record_count: 1,
            block_count: 1,
            start_sector: 40,
            ffd1: 1,
            timestamp: OasisTimestamp::new(1, 1, 1980, 0, 0),
            owner_id: 0,
            shared_from_owner_id: 0,
            ffd2: 0,
        };
        let report = check(&layout, 4000, &[], None);
        assert!(report
            .findings
            .iter()
            .any(|f| f.message.contains("does not mark allocated")));
    }
}
