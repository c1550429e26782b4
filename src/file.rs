//! Stream data access on top of the chain resolver: whole-cluster I/O
//! for directories and reserved files, byte-ranged reads and writes for
//! file contents.

use crate::block_dev::BlockDevice;
use crate::chain::{self, ChainCursor, StreamView};
use crate::error::{FsError, Result};
use crate::volume::{ClusterId, Volume};

/// Reads a full cluster from the heap.
pub fn read_cluster(
    device: &impl BlockDevice,
    volume: &Volume,
    cluster: ClusterId,
) -> Result<Vec<u8>> {
    let first = volume.cluster_to_sector(cluster)?;
    let sector_size = volume.sector_size();
    let mut buf = vec![0u8; volume.cluster_size()];
    for i in 0..volume.sectors_per_cluster() as u64 {
        let off = i as usize * sector_size;
        device.read_sector(first + i, &mut buf[off..off + sector_size])?;
    }
    Ok(buf)
}

/// Writes a cluster to the heap, zero-padding a short buffer.
pub fn write_cluster(
    device: &impl BlockDevice,
    volume: &Volume,
    cluster: ClusterId,
    data: &[u8],
) -> Result<()> {
    let first = volume.cluster_to_sector(cluster)?;
    let sector_size = volume.sector_size();
    let mut sector = vec![0u8; sector_size];
    for i in 0..volume.sectors_per_cluster() as u64 {
        let off = i as usize * sector_size;
        sector.fill(0);
        if off < data.len() {
            let take = sector_size.min(data.len() - off);
            sector[..take].copy_from_slice(&data[off..off + take]);
        }
        device.write_sector(first + i, &sector)?;
    }
    Ok(())
}

/// Reads a stream's clusters in chain order into one buffer, returning
/// the data and the clusters backing it.
pub fn read_stream_clusters(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
) -> Result<(Vec<u8>, Vec<ClusterId>)> {
    let clusters = chain::stream_clusters(device, volume, stream)?;
    let mut data = Vec::with_capacity(clusters.len() * volume.cluster_size());
    for &cluster in &clusters {
        data.extend_from_slice(&read_cluster(device, volume, cluster)?);
    }
    Ok((data, clusters))
}

/// Reads bytes from a stream at `offset`. The whole requested range must
/// lie inside the stream.
pub fn read_stream(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
    cursor: &mut ChainCursor,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if offset + buf.len() as u64 > stream.data_length {
        return Err(FsError::OutOfBounds);
    }
    let sector_size = volume.sector_size() as u64;
    let mut sector_buf = vec![0u8; sector_size as usize];
    let mut done = 0usize;
    let mut at = offset;
    while done < buf.len() {
        let (physical, _run) =
            chain::resolve(device, volume, stream, cursor, at / sector_size)?;
        device.read_sector(physical, &mut sector_buf)?;
        let within = (at % sector_size) as usize;
        let take = (sector_size as usize - within).min(buf.len() - done);
        buf[done..done + take].copy_from_slice(&sector_buf[within..within + take]);
        done += take;
        at += take as u64;
    }
    Ok(done)
}

/// Writes bytes into a stream at `offset`, within its existing
/// allocation; growing a stream is the caller's job.
pub fn write_stream(
    device: &impl BlockDevice,
    volume: &Volume,
    stream: &StreamView,
    cursor: &mut ChainCursor,
    offset: u64,
    buf: &[u8],
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if offset + buf.len() as u64 > stream.data_length {
        return Err(FsError::OutOfBounds);
    }
    let sector_size = volume.sector_size() as u64;
    let mut sector_buf = vec![0u8; sector_size as usize];
    let mut done = 0usize;
    let mut at = offset;
    while done < buf.len() {
        let (physical, _run) =
            chain::resolve(device, volume, stream, cursor, at / sector_size)?;
        let within = (at % sector_size) as usize;
        let take = (sector_size as usize - within).min(buf.len() - done);
        if take < sector_size as usize {
            device.read_sector(physical, &mut sector_buf)?;
        }
        sector_buf[within..within + take].copy_from_slice(&buf[done..done + take]);
        device.write_sector(physical, &sector_buf)?;
        done += take;
        at += take as u64;
    }
    Ok(done)
}
