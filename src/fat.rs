//! FAT table access. Each cluster id indexes a 32-bit little-endian slot
//! in the table; slots 0 and 1 are the media descriptor and a reserved
//! entry, never part of any chain.

use crate::block_dev::BlockDevice;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::volume::{ClusterId, Volume};

fn slot_position(volume: &Volume, cluster: ClusterId) -> Result<(u64, usize)> {
    if cluster > volume.cluster_count + 1 {
        return Err(FsError::InvalidCluster(cluster));
    }
    let byte = cluster as u64 * 4;
    let sector_size = volume.sector_size() as u64;
    let sector_in_fat = byte / sector_size;
    if sector_in_fat >= volume.fat_length as u64 {
        return Err(FsError::InvalidCluster(cluster));
    }
    Ok((sector_in_fat, (byte % sector_size) as usize))
}

/// Reads the raw FAT slot of a cluster from the first FAT.
pub fn fat_entry(
    device: &impl BlockDevice,
    volume: &Volume,
    cluster: ClusterId,
) -> Result<u32> {
    let (sector_in_fat, off) = slot_position(volume, cluster)?;
    let mut buf = vec![0u8; volume.sector_size()];
    device.read_sector(volume.fat_offset as u64 + sector_in_fat, &mut buf)?;
    Ok(u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]))
}

/// Writes the FAT slot of a cluster, mirrored into every FAT copy.
pub fn set_fat_entry(
    device: &impl BlockDevice,
    volume: &Volume,
    cluster: ClusterId,
    value: u32,
) -> Result<()> {
    let (sector_in_fat, off) = slot_position(volume, cluster)?;
    let mut buf = vec![0u8; volume.sector_size()];
    for copy in 0..volume.number_of_fats {
        let sector = volume.fat_offset as u64
            + copy as u64 * volume.fat_length as u64
            + sector_in_fat;
        device.read_sector(sector, &mut buf)?;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        device.write_sector(sector, &buf)?;
    }
    Ok(())
}

/// One validated chain hop. `None` means end-of-chain; a free slot, the
/// bad-cluster marker, or an out-of-range id aborts the walk as a fatal
/// consistency violation.
pub fn next_in_chain(
    device: &impl BlockDevice,
    volume: &Volume,
    cluster: ClusterId,
) -> Result<Option<ClusterId>> {
    let value = fat_entry(device, volume, cluster)?;
    match value {
        FAT_EOC => Ok(None),
        FAT_FREE | FAT_BAD => Err(FsError::InvalidCluster(value)),
        next if volume.is_valid_cluster(next) => Ok(Some(next)),
        next => Err(FsError::InvalidCluster(next)),
    }
}
