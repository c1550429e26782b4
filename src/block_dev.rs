use crate::error::FsError;

/// Abstraction over the sector store backing a volume. A caching layer,
/// when present, wraps a device and implements this same trait; the
/// engine never knows whether it is talking to hardware or a cache.
pub trait BlockDevice: Send + Sync {
    /// Returns the number of sectors on the device.
    fn num_sectors(&self) -> u64;

    /// Returns the sector size in bytes, a power of two in [512, 4096].
    fn sector_size(&self) -> usize;

    /// Reads one sector. buf.len() must equal sector_size().
    fn read_sector(&self, sector_id: u64, buf: &mut [u8]) -> Result<(), FsError>;

    /// Writes one sector. buf.len() must equal sector_size().
    fn write_sector(&self, sector_id: u64, buf: &[u8]) -> Result<(), FsError>;

    /// Flushes any buffered writes to stable storage.
    fn flush(&self) -> Result<(), FsError>;
}
