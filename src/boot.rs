//! Boot sector codec. A volume carries two redundant 12-sector boot
//! regions: the primary at sector 0 and a backup at sector 12. Each
//! region is accepted only if its checksum sector matches the sum over
//! the first 11 sectors, the magic bytes are present, and every
//! structural field passes [`Volume::validate`].

use crate::block_dev::BlockDevice;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::volume::Volume;

// Byte offsets within sector 0.
const OFF_JUMP_BOOT: usize = 0;
const OFF_FS_NAME: usize = 3;
const OFF_MUST_BE_ZERO: usize = 11;
const OFF_VOLUME_LENGTH: usize = 72;
const OFF_FAT_OFFSET: usize = 80;
const OFF_FAT_LENGTH: usize = 84;
const OFF_CLUSTER_HEAP_OFFSET: usize = 88;
const OFF_CLUSTER_COUNT: usize = 92;
const OFF_FIRST_ROOT_CLUSTER: usize = 96;
const OFF_VOLUME_SERIAL: usize = 100;
const OFF_FS_REVISION: usize = 104;
const OFF_VOLUME_FLAGS: usize = 106;
const OFF_SECTOR_SHIFT: usize = 108;
const OFF_CLUSTER_SHIFT: usize = 109;
const OFF_NUMBER_OF_FATS: usize = 110;
const OFF_DRIVE_SELECT: usize = 111;
const OFF_PERCENT_IN_USE: usize = 112;
const OFF_BOOT_SIGNATURE: usize = 510;

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Parses and structurally validates one boot sector image.
pub fn parse_boot_sector(buf: &[u8]) -> Result<Volume> {
    if buf.len() < 512 {
        return Err(FsError::InvalidBootRegion);
    }
    if buf[OFF_JUMP_BOOT..OFF_JUMP_BOOT + 3] != JUMP_BOOT {
        return Err(FsError::InvalidBootRegion);
    }
    if &buf[OFF_FS_NAME..OFF_FS_NAME + 8] != FS_NAME {
        return Err(FsError::InvalidBootRegion);
    }
    if buf[OFF_MUST_BE_ZERO..OFF_VOLUME_LENGTH - 8].iter().any(|&b| b != 0) {
        return Err(FsError::InvalidBootRegion);
    }
    if read_u16(buf, OFF_BOOT_SIGNATURE) != BOOT_SIGNATURE {
        return Err(FsError::InvalidBootRegion);
    }

    let volume = Volume {
        volume_length: read_u64(buf, OFF_VOLUME_LENGTH),
        fat_offset: read_u32(buf, OFF_FAT_OFFSET),
        fat_length: read_u32(buf, OFF_FAT_LENGTH),
        cluster_heap_offset: read_u32(buf, OFF_CLUSTER_HEAP_OFFSET),
        cluster_count: read_u32(buf, OFF_CLUSTER_COUNT),
        first_root_cluster: read_u32(buf, OFF_FIRST_ROOT_CLUSTER),
        volume_serial: read_u32(buf, OFF_VOLUME_SERIAL),
        volume_flags: read_u16(buf, OFF_VOLUME_FLAGS),
        bytes_per_sector_shift: buf[OFF_SECTOR_SHIFT],
        sectors_per_cluster_shift: buf[OFF_CLUSTER_SHIFT],
        number_of_fats: buf[OFF_NUMBER_OF_FATS],
        percent_in_use: buf[OFF_PERCENT_IN_USE],
    };
    volume.validate()?;
    Ok(volume)
}

/// Writes a boot sector image for `volume` into `buf` (one sector).
pub fn encode_boot_sector(volume: &Volume, buf: &mut [u8]) {
    buf.fill(0);
    buf[OFF_JUMP_BOOT..OFF_JUMP_BOOT + 3].copy_from_slice(&JUMP_BOOT);
    buf[OFF_FS_NAME..OFF_FS_NAME + 8].copy_from_slice(FS_NAME);
    buf[OFF_VOLUME_LENGTH..OFF_VOLUME_LENGTH + 8]
        .copy_from_slice(&volume.volume_length.to_le_bytes());
    buf[OFF_FAT_OFFSET..OFF_FAT_OFFSET + 4].copy_from_slice(&volume.fat_offset.to_le_bytes());
    buf[OFF_FAT_LENGTH..OFF_FAT_LENGTH + 4].copy_from_slice(&volume.fat_length.to_le_bytes());
    buf[OFF_CLUSTER_HEAP_OFFSET..OFF_CLUSTER_HEAP_OFFSET + 4]
        .copy_from_slice(&volume.cluster_heap_offset.to_le_bytes());
    buf[OFF_CLUSTER_COUNT..OFF_CLUSTER_COUNT + 4]
        .copy_from_slice(&volume.cluster_count.to_le_bytes());
    buf[OFF_FIRST_ROOT_CLUSTER..OFF_FIRST_ROOT_CLUSTER + 4]
        .copy_from_slice(&volume.first_root_cluster.to_le_bytes());
    buf[OFF_VOLUME_SERIAL..OFF_VOLUME_SERIAL + 4]
        .copy_from_slice(&volume.volume_serial.to_le_bytes());
    buf[OFF_FS_REVISION..OFF_FS_REVISION + 2].copy_from_slice(&FS_REVISION.to_le_bytes());
    buf[OFF_VOLUME_FLAGS..OFF_VOLUME_FLAGS + 2]
        .copy_from_slice(&volume.volume_flags.to_le_bytes());
    buf[OFF_SECTOR_SHIFT] = volume.bytes_per_sector_shift;
    buf[OFF_CLUSTER_SHIFT] = volume.sectors_per_cluster_shift;
    buf[OFF_NUMBER_OF_FATS] = volume.number_of_fats;
    buf[OFF_DRIVE_SELECT] = 0x80;
    buf[OFF_PERCENT_IN_USE] = volume.percent_in_use;
    buf[OFF_BOOT_SIGNATURE..OFF_BOOT_SIGNATURE + 2]
        .copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
}

/// 32-bit rotate-right-and-add checksum over the first 11 sectors of a
/// boot region. The three offsets in [`BOOT_CHECKSUM_SKIP`] are excluded
/// from the sum; the list is literal format law, not derived here.
pub fn boot_region_checksum(region: &[u8], sector_size: usize) -> u32 {
    let summed = sector_size * (BOOT_REGION_SECTORS as usize - 1);
    let mut checksum: u32 = 0;
    for (i, &byte) in region[..summed].iter().enumerate() {
        if BOOT_CHECKSUM_SKIP.contains(&i) {
            continue;
        }
        checksum = checksum.rotate_right(1).wrapping_add(byte as u32);
    }
    checksum
}

/// Reads a full 12-sector boot region into one buffer.
pub fn read_boot_region(
    device: &impl BlockDevice,
    base_sector: u64,
) -> Result<Vec<u8>> {
    let sector_size = device.sector_size();
    let mut region = vec![0u8; sector_size * BOOT_REGION_SECTORS as usize];
    for i in 0..BOOT_REGION_SECTORS {
        let off = i as usize * sector_size;
        device.read_sector(base_sector + i, &mut region[off..off + sector_size])?;
    }
    Ok(region)
}

/// Checks the stored checksum sector of a region buffer. Every 32-bit
/// word of the 12th sector must repeat the computed checksum.
pub fn region_checksum_matches(region: &[u8], sector_size: usize) -> bool {
    let computed = boot_region_checksum(region, sector_size);
    let stored = &region[sector_size * (BOOT_REGION_SECTORS as usize - 1)..];
    stored
        .chunks_exact(4)
        .all(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) == computed)
}

/// Loads and fully validates one boot region.
pub fn load_boot_region(device: &impl BlockDevice, base_sector: u64) -> Result<Volume> {
    let sector_size = device.sector_size();
    let region = read_boot_region(device, base_sector)?;
    if !region_checksum_matches(&region, sector_size) {
        return Err(FsError::InvalidBootRegion);
    }
    let volume = parse_boot_sector(&region[..sector_size])?;
    if volume.sector_size() != sector_size {
        return Err(FsError::InvalidGeometry);
    }
    if volume.volume_length > device.num_sectors() {
        return Err(FsError::InvalidGeometry);
    }
    Ok(volume)
}

/// Loads the volume descriptor, falling back to the backup boot region
/// when the primary fails. Both failing is fatal: there is no filesystem.
pub fn read_boot(device: &impl BlockDevice) -> Result<Volume> {
    match load_boot_region(device, 0) {
        Ok(volume) => Ok(volume),
        Err(FsError::Io) => Err(FsError::Io),
        Err(_) => load_boot_region(device, BACKUP_BOOT_SECTOR)
            .map_err(|_| FsError::InvalidBootRegion),
    }
}

/// Writes a complete 12-sector boot region for `volume` at `base_sector`,
/// including the extended boot sectors and the trailing checksum sector.
pub fn write_boot_region(
    device: &impl BlockDevice,
    volume: &Volume,
    base_sector: u64,
) -> Result<()> {
    let sector_size = device.sector_size();
    let mut region = vec![0u8; sector_size * BOOT_REGION_SECTORS as usize];

    encode_boot_sector(volume, &mut region[..sector_size]);
    // Extended boot sectors 1..=8 carry only their trailing signature.
    for i in 1..=8usize {
        let end = (i + 1) * sector_size;
        region[end - 4..end].copy_from_slice(&EXTENDED_BOOT_SIGNATURE.to_le_bytes());
    }
    // Sectors 9 (OEM parameters) and 10 (reserved) stay zeroed.

    let checksum = boot_region_checksum(&region, sector_size);
    let checksum_off = sector_size * (BOOT_REGION_SECTORS as usize - 1);
    for word in region[checksum_off..].chunks_exact_mut(4) {
        word.copy_from_slice(&checksum.to_le_bytes());
    }

    for i in 0..BOOT_REGION_SECTORS {
        let off = i as usize * sector_size;
        device.write_sector(base_sector + i, &region[off..off + sector_size])?;
    }
    Ok(())
}
