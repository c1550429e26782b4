//! Volume builder output: layout invariants, reserved file placement,
//! and the build -> check round trip.

mod common;

use std::sync::Arc;

use common::RamDisk;
use exfat::{
    AllocStrategy, BlockDevice, BuildParams, CheckOptions, Error, ExFat, FAT_EOC, build, check,
    fat_entry, read_boot,
};

fn params(size_sectors: u64) -> BuildParams {
    BuildParams {
        size_sectors,
        bytes_per_sector_shift: 9,
        sectors_per_cluster_shift: 2,
        fat_alignment: 8,
        heap_alignment: 16,
        number_of_fats: 1,
        label: "TESTVOL".to_string(),
        serial: 0xC0FF_EE00,
    }
}

#[test]
fn built_volume_satisfies_the_layout_invariants() {
    let disk = RamDisk::new(4096);
    let volume = build(&disk, &params(4096)).unwrap();
    log!("built layout: {:?}", volume);
    volume.validate().unwrap();
    assert!(volume.fat_offset >= 24);
    assert_eq!(volume.cluster_heap_offset % 16, 0);
    assert_eq!(volume.volume_serial, 0xC0FF_EE00);
    // Reserved files start at cluster 2: bitmap, up-case table, root.
    assert_eq!(volume.first_root_cluster, 4);
}

#[test]
fn boot_region_round_trips_and_backup_is_identical() {
    let disk = RamDisk::new(4096);
    let built = build(&disk, &params(4096)).unwrap();
    let loaded = read_boot(&disk).unwrap();
    assert_eq!(built, loaded);

    let mut primary = vec![0u8; 512];
    let mut backup = vec![0u8; 512];
    disk.read_sector(0, &mut primary).unwrap();
    disk.read_sector(12, &mut backup).unwrap();
    assert_eq!(primary, backup);
}

#[test]
fn primary_boot_failure_falls_back_to_backup() {
    let disk = RamDisk::new(4096);
    let built = build(&disk, &params(4096)).unwrap();

    let mut sector = vec![0u8; 512];
    disk.read_sector(0, &mut sector).unwrap();
    sector[80] ^= 0xFF; // FatOffset field; breaks the region checksum
    disk.write_sector(0, &sector).unwrap();
    assert_eq!(read_boot(&disk).unwrap(), built);

    // With the backup gone too there is no filesystem.
    disk.read_sector(12, &mut sector).unwrap();
    sector[80] ^= 0xFF;
    disk.write_sector(12, &sector).unwrap();
    assert_eq!(read_boot(&disk), Err(Error::InvalidBootRegion));
}

#[test]
fn reserved_files_are_chained_in_the_fat() {
    let disk = RamDisk::new(4096);
    let volume = build(&disk, &params(4096)).unwrap();
    // Head slots carry the media descriptor and the reserved marker.
    assert_eq!(fat_entry(&disk, &volume, 0).unwrap(), 0xFFFF_FFF8);
    assert_eq!(fat_entry(&disk, &volume, 1).unwrap(), 0xFFFF_FFFF);
    // Single-cluster reserved files terminate immediately.
    assert_eq!(fat_entry(&disk, &volume, 2).unwrap(), FAT_EOC);
    assert_eq!(fat_entry(&disk, &volume, 3).unwrap(), FAT_EOC);
    assert_eq!(fat_entry(&disk, &volume, volume.first_root_cluster).unwrap(), FAT_EOC);
    // Everything past the reserved span is free.
    assert_eq!(fat_entry(&disk, &volume, 5).unwrap(), 0);
}

#[test]
fn fresh_volume_mounts_with_its_metadata() {
    let disk = Arc::new(RamDisk::new(4096));
    build(&*disk, &params(4096)).unwrap();
    let fs = ExFat::mount(Arc::clone(&disk), AllocStrategy::Linear).unwrap();
    assert_eq!(fs.label(), Some("TESTVOL"));
    assert_eq!(fs.bitmap_entry().first_cluster, 2);
    assert_eq!(fs.upcase_entry().first_cluster, 3);
    // Three reserved clusters are in use on a fresh volume.
    assert_eq!(fs.free_clusters(), fs.volume().cluster_count - 3);
    assert!(exfat::verify_upcase_table(&*disk, fs.volume(), fs.upcase_entry()).unwrap());
}

#[test]
fn fresh_volume_checks_clean() {
    let disk = RamDisk::new(4096);
    build(&disk, &params(4096)).unwrap();
    let report = check(&disk, CheckOptions::default()).unwrap();
    assert!(report.clean(), "unexpected defects: {:?}", report.defects);
    assert_eq!(report.repairs_applied, 0);
}

#[test]
fn two_fat_copies_build_and_check_clean() {
    let disk = RamDisk::new(8192);
    let mut p = params(8192);
    p.number_of_fats = 2;
    let volume = build(&disk, &p).unwrap();
    assert_eq!(volume.number_of_fats, 2);
    // Two bitmap files precede the up-case table and root.
    assert_eq!(volume.first_root_cluster, 5);
    let report = check(&disk, CheckOptions::default()).unwrap();
    assert!(report.clean(), "unexpected defects: {:?}", report.defects);
}

#[test]
fn four_kib_sectors_build_and_check_clean() {
    let disk = RamDisk::with_sector_size(2048, 4096);
    let mut p = params(2048);
    p.bytes_per_sector_shift = 12;
    p.sectors_per_cluster_shift = 0;
    let volume = build(&disk, &p).unwrap();
    assert_eq!(volume.sector_size(), 4096);
    let report = check(&disk, CheckOptions::default()).unwrap();
    assert!(report.clean(), "unexpected defects: {:?}", report.defects);
}

#[test]
fn undersized_device_is_rejected() {
    let disk = RamDisk::new(32);
    // No room for a cluster heap behind the FAT region.
    assert_eq!(build(&disk, &params(32)), Err(Error::VolumeTooSmall));
    // Requested size beyond the device.
    assert_eq!(build(&disk, &params(4096)), Err(Error::VolumeTooSmall));
}
