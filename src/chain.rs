//! Chain resolver: maps a stream's logical sector to its physical sector,
//! either by dead-reckoning for contiguous (NoFatChain) streams or by
//! walking the FAT linked list. FAT walks keep a cursor per open stream
//! so sequential access never re-walks from the head.

use crate::block_dev::BlockDevice;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::fat::next_in_chain;
use crate::volume::{ClusterId, Volume};

/// The allocation view of one stream, decoded from its Stream-Extension
/// record (or synthesized for the root directory and reserved files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamView {
    pub first_cluster: ClusterId,
    pub data_length: u64,
    pub no_fat_chain: bool,
}

impl StreamView {
    pub fn num_sectors(&self, volume: &Volume) -> u64 {
        volume.bytes_to_sectors(self.data_length)
    }

    pub fn num_clusters(&self, volume: &Volume) -> u32 {
        volume.bytes_to_clusters(self.data_length)
    }
}

/// Last resolved (logical cluster, physical cluster) pair of a FAT walk.
/// Lookups restart from the cursor only when it is at or before the
/// requested logical cluster; a later cursor is never walked backwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainCursor {
    logical: u32,
    physical: ClusterId,
}

impl ChainCursor {
    pub fn new() -> Self {
        Self { logical: 0, physical: 0 }
    }

    fn valid(&self) -> bool {
        self.physical != 0
    }
}

/// Physical cluster backing a stream's logical cluster index.
fn resolve_cluster(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
    cursor: &mut ChainCursor,
    logical_cluster: u32,
) -> Result<ClusterId> {
    if !volume.is_valid_cluster(stream.first_cluster) {
        return Err(FsError::InvalidCluster(stream.first_cluster));
    }

    if stream.no_fat_chain {
        let physical = stream.first_cluster + logical_cluster;
        if !volume.is_valid_cluster(physical) {
            return Err(FsError::InvalidCluster(physical));
        }
        return Ok(physical);
    }

    let (mut at, mut physical) = if cursor.valid() && cursor.logical <= logical_cluster {
        (cursor.logical, cursor.physical)
    } else {
        (0, stream.first_cluster)
    };
    while at < logical_cluster {
        // A premature end marker means the chain is shorter than the
        // declared data length; surface it as the bogus hop value.
        physical = next_in_chain(device, volume, physical)?
            .ok_or(FsError::InvalidCluster(FAT_EOC))?;
        at += 1;
    }
    cursor.logical = logical_cluster;
    cursor.physical = physical;
    Ok(physical)
}

/// Maps a logical sector of a stream to its physical sector, returning
/// how many following logical sectors are contiguous from it so callers
/// can batch I/O.
pub fn resolve(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
    cursor: &mut ChainCursor,
    logical_sector: u64,
) -> Result<(u64, u64)> {
    let total_sectors = stream.num_sectors(volume);
    if logical_sector >= total_sectors {
        return Err(FsError::OutOfBounds);
    }
    let spc = volume.sectors_per_cluster() as u64;
    let remaining = total_sectors - logical_sector;

    if stream.no_fat_chain {
        let last = stream.first_cluster + stream.num_clusters(volume) - 1;
        if !volume.is_valid_cluster(last) {
            return Err(FsError::InvalidCluster(last));
        }
        let base = volume.cluster_to_sector(stream.first_cluster)?;
        return Ok((base + logical_sector, remaining));
    }

    let logical_cluster = (logical_sector / spc) as u32;
    let physical = resolve_cluster(device, volume, stream, cursor, logical_cluster)?;
    let within = logical_sector % spc;
    let sector = volume.cluster_to_sector(physical)? + within;

    let mut run = (spc - within).min(remaining);
    let mut tail = physical;
    while run < remaining {
        match next_in_chain(device, volume, tail)? {
            Some(next) if next == tail + 1 => {
                run = (run + spc).min(remaining);
                tail = next;
            }
            _ => break,
        }
    }
    Ok((sector, run))
}

/// Collects a full FAT chain starting at `first`. The walk is bounded by
/// the cluster count; exceeding it means the chain loops.
pub fn collect_chain(
    device: &impl BlockDevice,
    volume: &Volume,
    first: ClusterId,
) -> Result<Vec<ClusterId>> {
    let mut chain = Vec::new();
    let mut current = first;
    loop {
        if !volume.is_valid_cluster(current) {
            return Err(FsError::InvalidCluster(current));
        }
        chain.push(current);
        if chain.len() > volume.cluster_count as usize {
            return Err(FsError::ChainCycle);
        }
        match next_in_chain(device, volume, current)? {
            Some(next) => current = next,
            None => return Ok(chain),
        }
    }
}

/// Clusters of a stream in chain order, honoring dead-reckoning.
pub fn stream_clusters(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
) -> Result<Vec<ClusterId>> {
    if stream.first_cluster == 0 {
        return Ok(Vec::new());
    }
    if stream.no_fat_chain {
        let n = stream.num_clusters(volume);
        if n == 0 {
            return Ok(Vec::new());
        }
        let last = stream.first_cluster + n - 1;
        if !volume.is_valid_cluster(last) {
            return Err(FsError::InvalidCluster(last));
        }
        return Ok((stream.first_cluster..=last).collect());
    }
    // A FAT-linked chain is walked to its end marker even when the
    // declared length is unknown (the root directory records none).
    collect_chain(device, volume, stream.first_cluster)
}
