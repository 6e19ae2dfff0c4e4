//! `oasis-disk`: directory listing, file extraction/injection, erase,
//! rename, consistency checking and disk initialization for an OASIS
//! disk image.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use oasis_tools::check::check_with_container;
use oasis_tools::container;
use oasis_tools::container::imd::ImdContainer;
use oasis_tools::deb::FileOrganization;
use oasis_tools::filename::{wildcard_match, OasisName};
use oasis_tools::init::{Geometry, InitRequest, PrimaryOp};
use oasis_tools::layout::DiskLayout;
use oasis_tools::timestamp::OasisTimestamp;
use oasis_tools::writer::{create_file, erase_file, rename_file, CreateFileRequest};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "oasis-disk", about = "Inspect and manipulate OASIS disk images")]
struct Cli {
    /// Path to the disk image (.imd selects the ImageDisk adapter).
    image: PathBuf,

    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List files matching an optional wildcard pattern.
    List {
        #[arg(default_value = "*.*")]
        pattern: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print filesystem block details and run the consistency checker.
    Info {
        /// Clear orphaned allocation-map bits the checker finds (mutates the image).
        #[arg(long)]
        fix_orphans: bool,
    },
    /// Extract matching files to a host directory.
    Extract {
        #[arg(default_value = "*.*")]
        pattern: String,
        #[arg(default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        ascii: bool,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete matching directory entries and free their storage.
    Erase {
        pattern: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Rename a single matching entry.
    Rename {
        old_pattern: String,
        new_name: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Copy a host file onto the disk.
    Copy {
        host_file: PathBuf,
        oasis_name: Option<String>,
        #[arg(long)]
        ascii: bool,
        #[arg(long, default_value_t = 0)]
        owner: u8,
        #[arg(long, value_enum)]
        organization: Option<OrganizationArg>,
        #[arg(long)]
        record_length: Option<u16>,
    },
    /// Format, build, clear, label or write-protect the image.
    Initdisk {
        #[arg(long, conflicts_with_all = ["build", "clear"])]
        format: bool,
        #[arg(long, conflicts_with_all = ["format", "clear"])]
        build: bool,
        #[arg(long, conflicts_with_all = ["format", "build"])]
        clear: bool,
        #[arg(long)]
        num_heads: Option<u8>,
        #[arg(long)]
        num_cyl: Option<u8>,
        #[arg(long)]
        num_sectors: Option<u8>,
        #[arg(long)]
        dir_entries_max: Option<u8>,
        #[arg(long, default_value_t = 0)]
        additional_am_sectors: u8,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        wp: bool,
        #[arg(long)]
        nowp: bool,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum OrganizationArg {
    Sequential,
    Direct,
    Absolute,
    Relocatable,
    Indexed,
    Keyed,
}

impl From<OrganizationArg> for FileOrganization {
    fn from(a: OrganizationArg) -> Self {
        match a {
            OrganizationArg::Sequential => FileOrganization::Sequential,
            OrganizationArg::Direct => FileOrganization::Direct,
            OrganizationArg::Absolute => FileOrganization::Absolute,
            OrganizationArg::Relocatable => FileOrganization::Relocatable,
            OrganizationArg::Indexed => FileOrganization::Indexed,
            OrganizationArg::Keyed => FileOrganization::Keyed,
        }
    }
}

/// `"*"` or `"-1"` means "any owner"; otherwise an exact 0-255 match.
fn parse_owner_filter(raw: &Option<String>) -> Result<Option<u8>> {
    match raw.as_deref() {
        None | Some("*") | Some("-1") => Ok(None),
        Some(s) => Ok(Some(s.parse::<u8>().with_context(|| format!("invalid owner '{s}'"))?)),
    }
}

fn load_imd(path: &Path) -> Result<Option<ImdContainer>> {
    let is_imd = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("imd"))
        .unwrap_or(false);
    if !is_imd {
        return Ok(None);
    }
    Ok(Some(ImdContainer::open(path, false)?))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );

    match cli.command {
        Command::Initdisk { .. } => {}
        _ => {
            if !cli.image.exists() {
                bail!("disk image {} does not exist", cli.image.display());
            }
        }
    }

    let writable = match &cli.command {
        Command::List { .. } => false,
        Command::Info { fix_orphans } => *fix_orphans,
        _ => true,
    };
    let mut container = container::open(&cli.image, writable)
        .with_context(|| format!("opening {}", cli.image.display()))?;

    match cli.command {
        Command::List { pattern, owner } => {
            let owner_filter = parse_owner_filter(&owner)?;
            let layout = DiskLayout::load(container.as_mut())?;
            for deb in &layout.debs {
                if !deb.file_format.is_valid_entry() {
                    continue;
                }
                if let Some(o) = owner_filter {
                    if deb.owner_id != o {
                        continue;
                    }
                }
                let host_name = deb.oasis_name.to_host_string();
                if !wildcard_match(&pattern, &host_name) {
                    continue;
                }
                println!(
                    "{:<13} owner={:<3} blocks={:<5} org={:?}",
                    host_name,
                    deb.owner_id,
                    deb.block_count,
                    deb.file_format.organization()
                );
            }
        }
        Command::Info { fix_orphans } => {
            let mut layout = DiskLayout::load(container.as_mut())?;
            println!("label: {}", String::from_utf8_lossy(&layout.fsblock.label));
            println!(
                "geometry: heads={} cyl={} sectors={}",
                layout.fsblock.num_heads, layout.fsblock.num_cyl, layout.fsblock.num_sectors
            );
            println!("dir_entries_max: {}", layout.fsblock.dir_entries_max);
            println!("free_blocks: {}", layout.fsblock.free_blocks);
            println!("largest_free_run: {}", layout.alloc_map.largest_free_run());
            println!("write_protected: {}", layout.fsblock.write_protected());

            let imd = load_imd(&cli.image)?;
            let report = check_with_container(&layout, container.as_mut(), imd.as_ref(), None);
            println!(
                "consistency: {} files checked, {} errors, {} warnings",
                report.files_checked,
                report.error_count(),
                report.warning_count()
            );
            for finding in &report.findings {
                match finding.severity {
                    oasis_tools::check::Severity::Error => log::error!("{}", finding.message),
                    oasis_tools::check::Severity::Warning => log::warn!("{}", finding.message),
                }
                println!("  [{:?}] {}", finding.severity, finding.message);
            }

            if fix_orphans {
                let total = container.total_sectors();
                let cleared = oasis_tools::check::fix_orphans(&mut layout, total);
                if cleared > 0 {
                    layout.save(container.as_mut())?;
                }
                println!("fix_orphans: cleared {cleared} block(s)");
            }
        }
        Command::Extract { pattern, out_dir, ascii, owner } => {
            let owner_filter = parse_owner_filter(&owner)?;
            let layout = DiskLayout::load(container.as_mut())?;
            std::fs::create_dir_all(&out_dir)?;
            let mut extracted = 0;
            for deb in &layout.debs {
                if !deb.file_format.is_valid_entry() {
                    continue;
                }
                if let Some(o) = owner_filter {
                    if deb.owner_id != o {
                        continue;
                    }
                }
                let host_name = deb.oasis_name.to_host_string();
                if !wildcard_match(&pattern, &host_name) {
                    continue;
                }
                let mut data = oasis_tools::reader::read_file(container.as_mut(), deb)?;
                if ascii {
                    data.retain(|&b| b != 0x1A);
                }
                std::fs::write(out_dir.join(&host_name), &data)?;
                extracted += 1;
            }
            println!("extracted {extracted} file(s) to {}", out_dir.display());
        }
        Command::Erase { pattern, owner } => {
            let owner_filter = parse_owner_filter(&owner)?;
            let mut layout = DiskLayout::load(container.as_mut())?;
            let indices: Vec<usize> = layout
                .debs
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    d.file_format.is_valid_entry()
                        && owner_filter.map(|o| o == d.owner_id).unwrap_or(true)
                        && wildcard_match(&pattern, &d.oasis_name.to_host_string())
                })
                .map(|(i, _)| i)
                .collect();
            let count = indices.len();
            for idx in indices {
                erase_file(container.as_mut(), &mut layout, idx)?;
            }
            println!("erased {count} entries");
        }
        Command::Rename { old_pattern, new_name, owner } => {
            let owner_filter = parse_owner_filter(&owner)?;
            let mut layout = DiskLayout::load(container.as_mut())?;
            let renamed = rename_file(container.as_mut(), &mut layout, &old_pattern, owner_filter, &new_name)?;
            if !renamed {
                println!("no entries matched '{old_pattern}'");
            } else {
                println!("renamed to '{new_name}'");
            }
        }
        Command::Copy {
            host_file,
            oasis_name,
            ascii,
            owner,
            organization,
            record_length,
        } => {
            let mut data = std::fs::read(&host_file)?;
            if ascii {
                data.push(0x1A);
            }
            let host_name = oasis_name.unwrap_or_else(|| {
                host_file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
            // An explicit --organization/--record-length overrides; absent that,
            // a trailing "_FMT[_RL]" suffix on the host name supplies them;
            // absent both, default to Sequential.
            let (_, suffix) = oasis_tools::filename::split_extended_suffix(&host_name);
            let organization = organization
                .map(FileOrganization::from)
                .or_else(|| suffix.and_then(|(fmt, _)| FileOrganization::from_suffix_char(fmt)))
                .unwrap_or(FileOrganization::Sequential);
            let record_length = record_length.or_else(|| suffix.and_then(|(_, rl)| rl).map(|rl| rl as u16));
            let name = OasisName::from_host_string(&host_name)?;
            let mut layout = DiskLayout::load(container.as_mut())?;
            let req = CreateFileRequest {
                oasis_name: name,
                organization,
                owner_id: owner,
                attributes: 0,
                data: &data,
                record_length,
                load_origin: None,
                key_length: None,
                timestamp: Some(OasisTimestamp::from_chrono(chrono::Local::now())),
            };
            create_file(container.as_mut(), &mut layout, &req)?;
            println!("copied {} as {}", host_file.display(), host_name);
        }
        Command::Initdisk {
            format,
            build,
            clear,
            num_heads,
            num_cyl,
            num_sectors,
            dir_entries_max,
            additional_am_sectors,
            label,
            wp,
            nowp,
        } => {
            if wp && nowp {
                bail!("--wp and --nowp are mutually exclusive");
            }
            let primary = if format {
                let geometry = Geometry {
                    num_heads: num_heads.context("--num-heads is required with --format")?,
                    num_cyl: num_cyl.context("--num-cyl is required with --format")?,
                    num_sectors: num_sectors.context("--num-sectors is required with --format")?,
                    dir_entries_max: dir_entries_max.context("--dir-entries-max is required with --format")?,
                    additional_am_sectors,
                };
                Some(PrimaryOp::Format(geometry))
            } else if build {
                Some(PrimaryOp::Build)
            } else if clear {
                Some(PrimaryOp::Clear)
            } else {
                None
            };

            let label_bytes = match label {
                Some(l) => Some(OasisName::from_fields(&l, "")?.name),
                None => None,
            };

            let existing = if matches!(primary, Some(PrimaryOp::Format(_))) {
                None
            } else {
                DiskLayout::load(container.as_mut()).ok()
            };

            let req = InitRequest {
                primary,
                label: label_bytes,
                write_protect: if wp { Some(true) } else if nowp { Some(false) } else { None },
            };
            oasis_tools::init::run(container.as_mut(), &req, existing)?;
            println!("initdisk complete");
        }
    }

    Ok(())
}
