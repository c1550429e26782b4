//! Sector sources. The allocation bitmap and the up-case table are
//! ordinary files inside the cluster heap, but the builder also needs to
//! touch raw device regions before any file exists. Both are reached
//! through one trait so the allocator and resolver never know which
//! backs a given stream.

use crate::block_dev::BlockDevice;
use crate::chain::{self, ChainCursor, StreamView};
use crate::error::{FsError, Result};
use crate::volume::Volume;

pub trait BlockSource {
    /// Sectors addressable through this source.
    fn num_sectors(&self, volume: &Volume) -> u64;

    /// Reads the source's logical `sector` into `buf` (one sector).
    fn read_sector(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Writes the source's logical `sector` from `buf` (one sector).
    fn write_sector(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        sector: u64,
        buf: &[u8],
    ) -> Result<()>;
}

/// A fixed run of sectors addressed from the start of the device.
#[derive(Debug, Clone, Copy)]
pub struct RawRegion {
    pub start_sector: u64,
    pub num_sectors: u64,
}

impl BlockSource for RawRegion {
    fn num_sectors(&self, _volume: &Volume) -> u64 {
        self.num_sectors
    }

    fn read_sector(
        &mut self,
        device: &impl BlockDevice,
        _volume: &Volume,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if sector >= self.num_sectors {
            return Err(FsError::OutOfBounds);
        }
        device.read_sector(self.start_sector + sector, buf)
    }

    fn write_sector(
        &mut self,
        device: &impl BlockDevice,
        _volume: &Volume,
        sector: u64,
        buf: &[u8],
    ) -> Result<()> {
        if sector >= self.num_sectors {
            return Err(FsError::OutOfBounds);
        }
        device.write_sector(self.start_sector + sector, buf)
    }
}

/// A stream inside the cluster heap, addressed cluster-chain-relative
/// through the chain resolver.
#[derive(Debug, Clone, Copy)]
pub struct ChainSource {
    stream: StreamView,
    cursor: ChainCursor,
}

impl ChainSource {
    pub fn new(stream: StreamView) -> Self {
        Self { stream, cursor: ChainCursor::new() }
    }

    pub fn stream(&self) -> &StreamView {
        &self.stream
    }
}

impl BlockSource for ChainSource {
    fn num_sectors(&self, volume: &Volume) -> u64 {
        self.stream.num_sectors(volume)
    }

    fn read_sector(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let (physical, _run) =
            chain::resolve(device, volume, &self.stream, &mut self.cursor, sector)?;
        device.read_sector(physical, buf)
    }

    fn write_sector(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        sector: u64,
        buf: &[u8],
    ) -> Result<()> {
        let (physical, _run) =
            chain::resolve(device, volume, &self.stream, &mut self.cursor, sector)?;
        device.write_sector(physical, buf)
    }
}
