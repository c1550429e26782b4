//! Multi-pass consistency checker. Three strictly ordered passes:
//! Pass 0 validates the redundant boot regions, Pass 1 walks the
//! directory tree rebuilding an observed cluster bitmap, Pass 2
//! reconciles it with the persisted allocation bitmap. Pass 2 never
//! starts before Pass 1 has visited the whole tree.
//!
//! All scratch state lives in an explicit context, so the checker is
//! re-entrant; semantic findings become [`Defect`]s in the report while
//! device failures and fatal structure violations abort with an error.

use std::collections::BTreeSet;
use std::fmt;

use crate::block_dev::BlockDevice;
use crate::boot;
use crate::chain::{self, StreamView};
use crate::config::*;
use crate::dirent::{self, BitmapEntry};
use crate::error::{FsError, Result};
use crate::fat;
use crate::file;
use crate::source::{BlockSource, ChainSource};
use crate::volume::{ClusterId, Volume};

/// Repair policy of one checker run. `dry_run` suppresses every write;
/// `preen` answers every repair prompt with its default; `answer`
/// forces a uniform yes/no; `quiet` is honored by the reporting glue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    pub preen: bool,
    pub dry_run: bool,
    pub quiet: bool,
    pub answer: Option<bool>,
}

impl CheckOptions {
    /// Resolves a repair decision that would otherwise prompt.
    fn approve(&self, default: bool) -> bool {
        match self.answer {
            Some(answer) => answer,
            None if self.preen => true,
            None => default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    /// One boot region failed its checksum or structure while the
    /// sibling region is valid.
    BootRegionInvalid { backup: bool },
    /// Two files declare the same first cluster.
    DuplicateFirstCluster { cluster: ClusterId, path: String },
    /// A cluster already reached through another file's chain.
    DoubleAllocation { cluster: ClusterId, path: String },
    /// A FAT chain that loops instead of terminating.
    ChainCycle { path: String },
    /// A FAT chain hop left the valid cluster range.
    BrokenChain { path: String },
    /// A chain carrying more clusters than the file length needs.
    ChainPastEndOfFile { path: String, excess: u32 },
    /// A chain ending before the declared file length is covered.
    ChainTooShort { path: String },
    /// Candidate entry sets discarded during a directory scan.
    InvalidEntrySets { path: String, count: u32 },
    /// The up-case table does not match its recorded checksum.
    UpcaseChecksumMismatch,
    /// Declared free in the allocation bitmap but reachable.
    ClusterNotMarked { cluster: ClusterId },
    /// Declared used in the allocation bitmap but unreachable.
    ClusterLost { cluster: ClusterId },
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::BootRegionInvalid { backup: true } => {
                write!(f, "backup boot region invalid")
            }
            Defect::BootRegionInvalid { backup: false } => {
                write!(f, "primary boot region invalid")
            }
            Defect::DuplicateFirstCluster { cluster, path } => {
                write!(f, "{path}: first cluster {cluster} already claimed")
            }
            Defect::DoubleAllocation { cluster, path } => {
                write!(f, "{path}: cluster {cluster} allocated twice")
            }
            Defect::ChainCycle { path } => write!(f, "{path}: cluster chain loops"),
            Defect::BrokenChain { path } => {
                write!(f, "{path}: cluster chain leaves the valid range")
            }
            Defect::ChainPastEndOfFile { path, excess } => {
                write!(f, "{path}: chain holds {excess} clusters past end of file")
            }
            Defect::ChainTooShort { path } => {
                write!(f, "{path}: chain shorter than the declared length")
            }
            Defect::InvalidEntrySets { path, count } => {
                write!(f, "{path}: {count} invalid directory entry sets")
            }
            Defect::UpcaseChecksumMismatch => {
                write!(f, "up-case table checksum mismatch")
            }
            Defect::ClusterNotMarked { cluster } => {
                write!(f, "cluster {cluster} reachable but declared free")
            }
            Defect::ClusterLost { cluster } => {
                write!(f, "cluster {cluster} declared used but unreachable")
            }
        }
    }
}

#[derive(Debug)]
pub struct CheckReport {
    pub defects: Vec<Defect>,
    pub repairs_applied: u32,
}

impl CheckReport {
    /// A clean run found no defects at all; a dry run that found some
    /// reports them with zero repairs.
    pub fn clean(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Checker scratch state: the observed bitmap rebuilt by traversal and
/// the bookkeeping of Pass 1.
struct CheckContext<'a, D: BlockDevice> {
    device: &'a D,
    volume: Volume,
    opts: CheckOptions,
    observed: Vec<u8>,
    seen_first: BTreeSet<ClusterId>,
    bitmap_entry: Option<BitmapEntry>,
    defects: Vec<Defect>,
    repairs: u32,
}

impl<'a, D: BlockDevice> CheckContext<'a, D> {
    fn observed_bit(&self, cluster: ClusterId) -> bool {
        let idx = (cluster - FIRST_CLUSTER) as usize;
        self.observed[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_observed(&mut self, cluster: ClusterId) {
        let idx = (cluster - FIRST_CLUSTER) as usize;
        self.observed[idx / 8] |= 1 << (idx % 8);
    }

    /// Marks a validated stream's clusters, reporting double use.
    fn mark_clusters(&mut self, clusters: &[ClusterId], path: &str) {
        for &cluster in clusters {
            if self.observed_bit(cluster) {
                self.defects.push(Defect::DoubleAllocation {
                    cluster,
                    path: path.to_string(),
                });
            } else {
                self.set_observed(cluster);
            }
        }
    }

    fn may_write(&self, default: bool) -> bool {
        self.opts.approve(default) && !self.opts.dry_run
    }
}

/// Runs Pass 0 through Pass 2 and reports what was found and repaired.
pub fn check(device: &impl BlockDevice, opts: CheckOptions) -> Result<CheckReport> {
    let mut defects = Vec::new();
    let mut repairs = 0u32;
    let volume = pass0(device, &opts, &mut defects, &mut repairs)?;

    let bitmap_bytes = (volume.cluster_count as usize).div_ceil(8);
    let mut ctx = CheckContext {
        device,
        volume,
        opts,
        observed: vec![0u8; bitmap_bytes],
        seen_first: BTreeSet::new(),
        bitmap_entry: None,
        defects,
        repairs,
    };

    pass1(&mut ctx)?;
    pass2(&mut ctx)?;

    Ok(CheckReport {
        defects: ctx.defects,
        repairs_applied: ctx.repairs,
    })
}

/// Pass 0: both boot regions are validated independently; a bad region
/// with a valid sibling is rewritten from the sibling's raw sectors.
fn pass0(
    device: &impl BlockDevice,
    opts: &CheckOptions,
    defects: &mut Vec<Defect>,
    repairs: &mut u32,
) -> Result<Volume> {
    let primary = boot::load_boot_region(device, 0);
    let backup = boot::load_boot_region(device, BACKUP_BOOT_SECTOR);
    if primary == Err(FsError::Io) || backup == Err(FsError::Io) {
        return Err(FsError::Io);
    }

    match (primary, backup) {
        (Ok(volume), Ok(_)) => Ok(volume),
        (Ok(volume), Err(_)) => {
            defects.push(Defect::BootRegionInvalid { backup: true });
            if opts.approve(true) && !opts.dry_run {
                copy_boot_region(device, 0, BACKUP_BOOT_SECTOR)?;
                *repairs += 1;
            }
            Ok(volume)
        }
        (Err(_), Ok(volume)) => {
            defects.push(Defect::BootRegionInvalid { backup: false });
            if opts.approve(true) && !opts.dry_run {
                copy_boot_region(device, BACKUP_BOOT_SECTOR, 0)?;
                *repairs += 1;
            }
            Ok(volume)
        }
        (Err(_), Err(_)) => Err(FsError::InvalidBootRegion),
    }
}

fn copy_boot_region(device: &impl BlockDevice, from: u64, to: u64) -> Result<()> {
    let sector_size = device.sector_size();
    let region = boot::read_boot_region(device, from)?;
    for i in 0..BOOT_REGION_SECTORS {
        let off = i as usize * sector_size;
        device.write_sector(to + i, &region[off..off + sector_size])?;
    }
    Ok(())
}

/// Pass 1: depth-first reachability scan from the root directory.
/// Clusters enter the observed bitmap only after the set that owns them
/// passed its checksum.
fn pass1<D: BlockDevice>(ctx: &mut CheckContext<'_, D>) -> Result<()> {
    let root = StreamView {
        first_cluster: ctx.volume.first_root_cluster,
        data_length: 0,
        no_fat_chain: false,
    };
    let root_clusters = chain::stream_clusters(ctx.device, &ctx.volume, &root)?;
    ctx.mark_clusters(&root_clusters, "/");
    scan_tree(ctx, &root, "/", true)?;
    Ok(())
}

fn scan_tree<D: BlockDevice>(
    ctx: &mut CheckContext<'_, D>,
    dir: &StreamView,
    path: &str,
    is_root: bool,
) -> Result<()> {
    let (bytes, _) = file::read_stream_clusters(ctx.device, &ctx.volume, dir)?;
    let scan = dirent::scan_directory(&bytes);

    if scan.invalid_sets > 0 {
        ctx.defects.push(Defect::InvalidEntrySets {
            path: path.to_string(),
            count: scan.invalid_sets,
        });
    }

    if is_root {
        for &(_, bitmap) in &scan.bitmaps {
            let stream = StreamView {
                first_cluster: bitmap.first_cluster,
                data_length: bitmap.data_length,
                no_fat_chain: false,
            };
            let clusters = chain::stream_clusters(ctx.device, &ctx.volume, &stream)?;
            ctx.mark_clusters(&clusters, "<allocation bitmap>");
            if bitmap.which == 0 {
                ctx.bitmap_entry = Some(bitmap);
            }
        }
        if let Some((_, upcase)) = scan.upcase {
            let stream = StreamView {
                first_cluster: upcase.first_cluster,
                data_length: upcase.data_length,
                no_fat_chain: false,
            };
            let clusters = chain::stream_clusters(ctx.device, &ctx.volume, &stream)?;
            ctx.mark_clusters(&clusters, "<up-case table>");
            if !crate::fs::verify_upcase_table(ctx.device, &ctx.volume, &upcase)? {
                ctx.defects.push(Defect::UpcaseChecksumMismatch);
            }
        }
    }

    for (_, set) in scan.sets {
        let child_path = if path == "/" {
            format!("/{}", set.name)
        } else {
            format!("{}/{}", path, set.name)
        };
        if set.first_cluster == 0 {
            continue;
        }

        // A repeated first cluster means two files claim one chain;
        // report once and do not walk it again.
        if !ctx.seen_first.insert(set.first_cluster) {
            ctx.defects.push(Defect::DuplicateFirstCluster {
                cluster: set.first_cluster,
                path: child_path,
            });
            continue;
        }

        let stream = set.stream();
        let clusters = match chain::stream_clusters(ctx.device, &ctx.volume, &stream) {
            Ok(clusters) => clusters,
            Err(FsError::ChainCycle) => {
                ctx.defects.push(Defect::ChainCycle { path: child_path });
                continue;
            }
            Err(FsError::InvalidCluster(_)) => {
                ctx.defects.push(Defect::BrokenChain { path: child_path });
                continue;
            }
            Err(e) => return Err(e),
        };

        let needed = ctx.volume.bytes_to_clusters(set.data_length) as usize;
        if clusters.len() > needed && !set.is_directory() {
            let excess = (clusters.len() - needed) as u32;
            ctx.defects.push(Defect::ChainPastEndOfFile {
                path: child_path.clone(),
                excess,
            });
            // Truncating the chain strands the tail clusters; Pass 2
            // then clears their bitmap bits.
            if needed > 0 && ctx.may_write(true) {
                fat::set_fat_entry(ctx.device, &ctx.volume, clusters[needed - 1], FAT_EOC)?;
                ctx.repairs += 1;
            }
            ctx.mark_clusters(&clusters[..needed], &child_path);
        } else {
            if clusters.len() < needed {
                ctx.defects.push(Defect::ChainTooShort {
                    path: child_path.clone(),
                });
            }
            ctx.mark_clusters(&clusters, &child_path);
        }

        if set.is_directory() {
            scan_tree(ctx, &stream, &child_path, false)?;
        }
    }
    Ok(())
}

/// Pass 2: reconcile the observed bitmap with the persisted one,
/// comparing a sector at a time and descending to bits only where a
/// chunk differs.
fn pass2<D: BlockDevice>(ctx: &mut CheckContext<'_, D>) -> Result<()> {
    let bitmap = ctx.bitmap_entry.ok_or(FsError::MissingMetadata)?;
    let mut source = ChainSource::new(StreamView {
        first_cluster: bitmap.first_cluster,
        data_length: bitmap.data_length,
        no_fat_chain: false,
    });

    let sector_size = ctx.volume.sector_size();
    let total_bits = ctx.volume.cluster_count as usize;
    let bitmap_bytes = total_bits.div_ceil(8);
    let sectors = bitmap_bytes.div_ceil(sector_size) as u64;
    let mut declared = vec![0u8; sector_size];

    for sector in 0..sectors {
        source.read_sector(ctx.device, &ctx.volume, sector, &mut declared)?;
        let base_byte = sector as usize * sector_size;
        let end_byte = (base_byte + sector_size).min(bitmap_bytes);
        let observed = &ctx.observed[base_byte..end_byte];

        if declared[..end_byte - base_byte] == *observed {
            continue;
        }

        let mut changed = false;
        for byte in 0..end_byte - base_byte {
            if declared[byte] == observed[byte] {
                continue;
            }
            for bit in 0..8 {
                let idx = (base_byte + byte) * 8 + bit;
                if idx >= total_bits {
                    break;
                }
                let declared_bit = declared[byte] & (1 << bit) != 0;
                let observed_bit = observed[byte] & (1 << bit) != 0;
                if declared_bit == observed_bit {
                    continue;
                }
                let cluster = idx as u32 + FIRST_CLUSTER;
                if observed_bit {
                    ctx.defects.push(Defect::ClusterNotMarked { cluster });
                } else {
                    ctx.defects.push(Defect::ClusterLost { cluster });
                }
                if ctx.may_write(true) {
                    if observed_bit {
                        declared[byte] |= 1 << bit;
                    } else {
                        declared[byte] &= !(1 << bit);
                    }
                    changed = true;
                    ctx.repairs += 1;
                }
            }
        }
        if changed {
            source.write_sector(ctx.device, &ctx.volume, sector, &declared)?;
        }
    }
    Ok(())
}
