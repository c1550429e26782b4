//! Volume builder: computes the FAT/heap layout for a device, writes
//! the reserved files (allocation bitmap, up-case table, root
//! directory), the FAT copies and both boot regions. A freshly built
//! volume passes every checker pass with zero defects.

use crate::block_dev::BlockDevice;
use crate::boot;
use crate::config::*;
use crate::dirent::{self, BitmapEntry};
use crate::error::{FsError, Result};
use crate::file;
use crate::upcase::{self, UpcaseEntry};
use crate::volume::{ClusterId, Volume};

#[derive(Debug, Clone)]
pub struct BuildParams {
    /// Volume length in sectors; must fit the device.
    pub size_sectors: u64,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    /// FAT offset alignment in sectors (0 or 1 disables alignment).
    pub fat_alignment: u32,
    /// Cluster heap offset alignment in sectors.
    pub heap_alignment: u32,
    pub number_of_fats: u8,
    pub label: String,
    pub serial: u32,
}

fn align_up(value: u64, alignment: u32) -> u64 {
    let alignment = alignment.max(1) as u64;
    value.div_ceil(alignment) * alignment
}

/// Largest cluster count the format can address.
const MAX_CLUSTER_COUNT: u64 = (u32::MAX - 10) as u64;

/// The computed disc layout, fixed before any sector is written.
struct Layout {
    volume: Volume,
    /// Reserved files as (first cluster, cluster run), allocated in
    /// fixed order from cluster 2: bitmap copies, up-case table, root.
    reserved: Vec<(ClusterId, u32)>,
    upcase_clusters: u32,
    bitmap_length: u64,
    upcase_table: Vec<u16>,
}

fn compute_layout(device: &impl BlockDevice, params: &BuildParams) -> Result<Layout> {
    if params.bytes_per_sector_shift < MIN_SECTOR_SHIFT
        || params.bytes_per_sector_shift > MAX_SECTOR_SHIFT
        || params.bytes_per_sector_shift + params.sectors_per_cluster_shift
            > MAX_CLUSTER_SHIFT_TOTAL
        || !(1..=2).contains(&params.number_of_fats)
    {
        return Err(FsError::InvalidParams);
    }
    let sector_size = 1u64 << params.bytes_per_sector_shift;
    if sector_size as usize != device.sector_size() {
        return Err(FsError::InvalidParams);
    }
    if params.size_sectors > device.num_sectors() {
        return Err(FsError::VolumeTooSmall);
    }
    let spc = 1u64 << params.sectors_per_cluster_shift;
    let nfats = params.number_of_fats as u64;

    let fat_offset = align_up(MIN_FAT_OFFSET as u64, params.fat_alignment) as u32;

    // Fix the layout iteratively: every rounding step may shrink the
    // cluster count, which in turn shrinks the FAT, so recompute until
    // stable. The count never grows back across iterations.
    let mut cluster_count = (params.size_sectors / spc).min(MAX_CLUSTER_COUNT) as u32;
    let (fat_length, cluster_heap_offset) = loop {
        let fat_length =
            ((cluster_count as u64 + 2) * 4).div_ceil(sector_size) as u32;
        let heap_offset = align_up(
            fat_offset as u64 + nfats * fat_length as u64,
            params.heap_alignment,
        );
        let available = params
            .size_sectors
            .saturating_sub(heap_offset)
            .checked_div(spc)
            .unwrap_or(0)
            .min(MAX_CLUSTER_COUNT) as u32;
        if available >= cluster_count {
            if heap_offset > u32::MAX as u64 {
                return Err(FsError::VolumeTooSmall);
            }
            break (fat_length, heap_offset as u32);
        }
        cluster_count = available;
    };
    if cluster_count == 0 {
        return Err(FsError::VolumeTooSmall);
    }

    let cluster_size = sector_size * spc;
    let bitmap_length = (cluster_count as u64).div_ceil(8);
    let bitmap_clusters = bitmap_length.div_ceil(cluster_size) as u32;
    let upcase_table = upcase::default_table();
    let upcase_length = (upcase_table.len() * 2) as u64;
    let upcase_clusters = upcase_length.div_ceil(cluster_size) as u32;

    // Reserved files live at the head of the heap in fixed order.
    let mut reserved = Vec::new();
    let mut next = FIRST_CLUSTER;
    for _ in 0..params.number_of_fats {
        reserved.push((next, bitmap_clusters));
        next += bitmap_clusters;
    }
    reserved.push((next, upcase_clusters));
    next += upcase_clusters;
    reserved.push((next, 1)); // root directory
    let root_first = next;
    let used = next + 1 - FIRST_CLUSTER;
    if used > cluster_count {
        return Err(FsError::VolumeTooSmall);
    }

    let volume = Volume {
        volume_length: params.size_sectors,
        fat_offset,
        fat_length,
        cluster_heap_offset,
        cluster_count,
        first_root_cluster: root_first,
        volume_serial: params.serial,
        volume_flags: 0,
        bytes_per_sector_shift: params.bytes_per_sector_shift,
        sectors_per_cluster_shift: params.sectors_per_cluster_shift,
        number_of_fats: params.number_of_fats,
        percent_in_use: (used as u64 * 100 / cluster_count as u64) as u8,
    };
    volume.validate()?;

    Ok(Layout {
        volume,
        reserved,
        upcase_clusters,
        bitmap_length,
        upcase_table,
    })
}

/// Builds a complete volume on `device` and returns its descriptor.
pub fn build(device: &impl BlockDevice, params: &BuildParams) -> Result<Volume> {
    let layout = compute_layout(device, params)?;
    let volume = layout.volume;

    write_fat(device, &volume, &layout)?;
    write_upcase(device, &volume, &layout)?;
    write_bitmap(device, &volume, &layout)?;
    write_root_dir(device, &volume, params, &layout)?;

    boot::write_boot_region(device, &volume, 0)?;
    boot::write_boot_region(device, &volume, BACKUP_BOOT_SECTOR)?;
    device.flush()?;
    Ok(volume)
}

/// Writes every FAT copy: the two reserved head slots, a contiguous
/// `n -> n+1` chain per reserved file with an end marker on its last
/// cluster, and zeroes elsewhere.
fn write_fat(device: &impl BlockDevice, volume: &Volume, layout: &Layout) -> Result<()> {
    let used = layout.reserved.iter().map(|&(_, n)| n).sum::<u32>();
    let mut entries = vec![FAT_FREE; used as usize + 2];
    entries[0] = FAT_ENTRY_0;
    entries[1] = FAT_ENTRY_1;
    for &(first, count) in &layout.reserved {
        for cluster in first..first + count {
            entries[cluster as usize] = if cluster == first + count - 1 {
                FAT_EOC
            } else {
                cluster + 1
            };
        }
    }

    let sector_size = volume.sector_size();
    let slots_per_sector = sector_size / 4;
    let mut buf = vec![0u8; sector_size];
    for copy in 0..volume.number_of_fats {
        let base = volume.fat_offset as u64 + copy as u64 * volume.fat_length as u64;
        for sector in 0..volume.fat_length as u64 {
            buf.fill(0);
            let first_slot = sector as usize * slots_per_sector;
            for slot in 0..slots_per_sector {
                if let Some(&entry) = entries.get(first_slot + slot) {
                    buf[slot * 4..slot * 4 + 4].copy_from_slice(&entry.to_le_bytes());
                }
            }
            device.write_sector(base + sector, &buf)?;
        }
    }
    Ok(())
}

fn write_upcase(device: &impl BlockDevice, volume: &Volume, layout: &Layout) -> Result<()> {
    let bytes = upcase::table_bytes(&layout.upcase_table);
    let first = layout.reserved[volume.number_of_fats as usize].0;
    write_file_clusters(device, volume, first, layout.upcase_clusters, &bytes)
}

/// Writes each bitmap copy with exactly the reserved clusters marked
/// used and everything else free.
fn write_bitmap(device: &impl BlockDevice, volume: &Volume, layout: &Layout) -> Result<()> {
    let used = layout.reserved.iter().map(|&(_, n)| n).sum::<u32>();
    let mut bytes = vec![0u8; layout.bitmap_length as usize];
    for idx in 0..used as usize {
        bytes[idx / 8] |= 1 << (idx % 8);
    }
    for copy in 0..volume.number_of_fats {
        let (first, count) = layout.reserved[copy as usize];
        write_file_clusters(device, volume, first, count, &bytes)?;
    }
    Ok(())
}

fn write_root_dir(
    device: &impl BlockDevice,
    volume: &Volume,
    params: &BuildParams,
    layout: &Layout,
) -> Result<()> {
    let mut dir = vec![0u8; volume.cluster_size()];
    let mut offset = 0;

    if !params.label.is_empty() {
        let rec = dirent::encode_label_entry(&params.label)?;
        dir[offset..offset + DIRENT_SIZE].copy_from_slice(&rec);
        offset += DIRENT_SIZE;
    }
    for copy in 0..volume.number_of_fats {
        let (first, _) = layout.reserved[copy as usize];
        let rec = dirent::encode_bitmap_entry(&BitmapEntry {
            first_cluster: first,
            data_length: layout.bitmap_length,
            which: copy,
        });
        dir[offset..offset + DIRENT_SIZE].copy_from_slice(&rec);
        offset += DIRENT_SIZE;
    }
    let upcase_bytes = upcase::table_bytes(&layout.upcase_table);
    let rec = dirent::encode_upcase_entry(&UpcaseEntry {
        table_checksum: upcase::table_checksum(&upcase_bytes),
        first_cluster: layout.reserved[volume.number_of_fats as usize].0,
        data_length: upcase_bytes.len() as u64,
    });
    dir[offset..offset + DIRENT_SIZE].copy_from_slice(&rec);

    file::write_cluster(device, volume, volume.first_root_cluster, &dir)
}

/// Fills a contiguous cluster run with `data`, zero padding the tail.
fn write_file_clusters(
    device: &impl BlockDevice,
    volume: &Volume,
    first: ClusterId,
    count: u32,
    data: &[u8],
) -> Result<()> {
    let cluster_size = volume.cluster_size();
    for i in 0..count {
        let start = i as usize * cluster_size;
        let piece: &[u8] = if start < data.len() {
            &data[start..data.len().min(start + cluster_size)]
        } else {
            &[]
        };
        file::write_cluster(device, volume, first + i, piece)?;
    }
    Ok(())
}
