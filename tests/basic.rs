//! Allocator and chain resolver behavior against a RAM disk, with the
//! allocation bitmap placed in a raw sector region so the strategies
//! can be driven directly.

mod common;

use common::RamDisk;
use exfat::{
    AllocStrategy, Allocator, BlockDevice, ChainCursor, Error, FAT_EOC, RawRegion, StreamView,
    Volume, collect_chain, resolve, set_fat_entry,
};

const BITMAP_START: u64 = 1100;

fn test_volume(cluster_count: u32) -> Volume {
    let fat_length = ((cluster_count as u64 + 2) * 4).div_ceil(512) as u32;
    Volume {
        volume_length: 2048 + cluster_count as u64,
        fat_offset: 24,
        fat_length,
        cluster_heap_offset: 1024,
        cluster_count,
        first_root_cluster: 2,
        volume_serial: 0,
        volume_flags: 0,
        bytes_per_sector_shift: 9,
        sectors_per_cluster_shift: 0,
        number_of_fats: 1,
        percent_in_use: 0,
    }
}

fn bitmap_region(cluster_count: u32) -> RawRegion {
    let sectors = (cluster_count as u64).div_ceil(8).div_ceil(512);
    RawRegion { start_sector: BITMAP_START, num_sectors: sectors }
}

fn open_allocator(
    disk: &RamDisk,
    volume: &Volume,
    strategy: AllocStrategy,
) -> Allocator<RawRegion> {
    Allocator::init(disk, volume, bitmap_region(volume.cluster_count), strategy).unwrap()
}

/// Writes a raw bitmap image into the region backing the allocator.
fn write_bitmap_image(disk: &RamDisk, image: &[u8]) {
    let mut sector = vec![0u8; 512];
    for (i, chunk) in image.chunks(512).enumerate() {
        sector.fill(0);
        sector[..chunk.len()].copy_from_slice(chunk);
        disk.write_sector(BITMAP_START + i as u64, &sector).unwrap();
    }
}

#[test]
fn fresh_volume_allocates_sequentially() {
    for strategy in [AllocStrategy::Linear, AllocStrategy::CountingTree] {
        let disk = RamDisk::new(4096);
        let volume = test_volume(1024);
        let mut alloc = open_allocator(&disk, &volume, strategy);
        assert_eq!(alloc.free_clusters(), 1024);
        for expected in 2..=11 {
            assert_eq!(alloc.allocate(&disk, &volume, 2).unwrap(), expected);
        }
        assert_eq!(alloc.free_clusters(), 1014);
    }
}

#[test]
fn deallocate_restores_bitmap_byte_and_count() {
    for strategy in [AllocStrategy::Linear, AllocStrategy::CountingTree] {
        let disk = RamDisk::new(4096);
        let volume = test_volume(1024);
        let mut alloc = open_allocator(&disk, &volume, strategy);

        let mut before = vec![0u8; 512];
        disk.read_sector(BITMAP_START, &mut before).unwrap();
        let free_before = alloc.free_clusters();

        assert_eq!(alloc.allocate(&disk, &volume, 500).unwrap(), 500);
        assert!(alloc.is_allocated(&disk, &volume, 500).unwrap());
        alloc.deallocate(&disk, &volume, 500).unwrap();

        let mut after = vec![0u8; 512];
        disk.read_sector(BITMAP_START, &mut after).unwrap();
        // Bit 498 lives in byte 62; the whole sector must be restored.
        assert_eq!(before[62], after[62]);
        assert_eq!(before, after);
        assert_eq!(alloc.free_clusters(), free_before);
    }
}

#[test]
fn allocation_wraps_before_giving_up() {
    for strategy in [AllocStrategy::Linear, AllocStrategy::CountingTree] {
        let disk = RamDisk::new(4096);
        let cluster_count = 1024u32;
        // Every cluster from the hint to the end is taken.
        let hint = 1000u32;
        let mut image = vec![0u8; 128];
        for idx in (hint - 2)..cluster_count {
            image[idx as usize / 8] |= 1 << (idx % 8);
        }
        write_bitmap_image(&disk, &image);

        let volume = test_volume(cluster_count);
        let mut alloc = open_allocator(&disk, &volume, strategy);
        assert_eq!(alloc.allocate(&disk, &volume, hint).unwrap(), 2);
    }
}

#[test]
fn exhausted_volume_reports_out_of_space() {
    for strategy in [AllocStrategy::Linear, AllocStrategy::CountingTree] {
        let disk = RamDisk::new(4096);
        let cluster_count = 64u32;
        write_bitmap_image(&disk, &vec![0xFF; 8]);
        let volume = test_volume(cluster_count);
        let mut alloc = open_allocator(&disk, &volume, strategy);
        assert_eq!(alloc.free_clusters(), 0);
        assert_eq!(alloc.allocate(&disk, &volume, 2), Err(Error::OutOfSpace));
    }
}

#[test]
fn out_of_range_cluster_is_rejected() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    let mut alloc = open_allocator(&disk, &volume, AllocStrategy::Linear);
    assert_eq!(
        alloc.allocate(&disk, &volume, 1026),
        Err(Error::InvalidCluster(1026))
    );
    assert_eq!(
        alloc.deallocate(&disk, &volume, 0),
        Err(Error::InvalidCluster(0))
    );
}

#[test]
fn strategies_agree_on_a_fragmented_bitmap() {
    let cluster_count = 20000u32;
    let holes = [777u32, 8200, 19999];
    let mut image = vec![0xFFu8; (cluster_count as usize).div_ceil(8)];
    for &idx in &holes {
        image[idx as usize / 8] &= !(1 << (idx % 8));
    }
    // Mask the tail bits past the heap end.
    for idx in cluster_count..(image.len() as u32 * 8) {
        image[idx as usize / 8] &= !(1 << (idx % 8));
    }

    let mut results = Vec::new();
    for strategy in [AllocStrategy::Linear, AllocStrategy::CountingTree] {
        let disk = RamDisk::new(25000);
        write_bitmap_image(&disk, &image);
        let volume = test_volume(cluster_count);
        let mut alloc = open_allocator(&disk, &volume, strategy);

        let mut got = vec![alloc.free_clusters()];
        let mut hint = 2;
        for _ in 0..holes.len() {
            let cluster = alloc.allocate(&disk, &volume, hint).unwrap();
            got.push(cluster);
            hint = if cluster < cluster_count + 1 { cluster + 1 } else { 2 };
        }
        assert_eq!(alloc.allocate(&disk, &volume, 2), Err(Error::OutOfSpace));
        results.push(got);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], vec![3, 779, 8202, 20001]);
}

#[test]
fn counting_tree_serves_free_ranges_without_bitmap_reads() {
    // An all-free heap: the hint itself must come straight back.
    let disk = RamDisk::new(25000);
    let volume = test_volume(20000);
    let mut alloc = open_allocator(&disk, &volume, AllocStrategy::CountingTree);
    assert_eq!(alloc.allocate(&disk, &volume, 15000).unwrap(), 15000);
    assert_eq!(alloc.allocate(&disk, &volume, 15000).unwrap(), 15001);
    assert_eq!(alloc.allocate(&disk, &volume, 2).unwrap(), 2);
}

#[test]
fn dead_reckoning_resolves_by_arithmetic() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    let spc = volume.sectors_per_cluster() as u64;
    let stream = StreamView {
        first_cluster: 50,
        data_length: 3 * volume.cluster_size() as u64,
        no_fat_chain: true,
    };
    let mut cursor = ChainCursor::new();
    let (sector, run) =
        resolve(&disk, &volume, &stream, &mut cursor, 2 * spc).unwrap();
    assert_eq!(sector, volume.cluster_to_sector(52).unwrap());
    assert_eq!(run, spc);

    // The whole remainder of the file is one contiguous run.
    let (start, full_run) = resolve(&disk, &volume, &stream, &mut cursor, 0).unwrap();
    assert_eq!(start, volume.cluster_to_sector(50).unwrap());
    assert_eq!(full_run, 3 * spc);

    assert_eq!(
        resolve(&disk, &volume, &stream, &mut cursor, 3 * spc),
        Err(Error::OutOfBounds)
    );
}

#[test]
fn fat_walk_resolves_and_reuses_the_cursor() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    set_fat_entry(&disk, &volume, 50, 60).unwrap();
    set_fat_entry(&disk, &volume, 60, 70).unwrap();
    set_fat_entry(&disk, &volume, 70, FAT_EOC).unwrap();

    let stream = StreamView {
        first_cluster: 50,
        data_length: 3 * volume.cluster_size() as u64,
        no_fat_chain: false,
    };
    let mut cursor = ChainCursor::new();
    let (sector, run) = resolve(&disk, &volume, &stream, &mut cursor, 1).unwrap();
    assert_eq!(sector, volume.cluster_to_sector(60).unwrap());
    assert_eq!(run, 1);

    // Sequential access continues from the cached walk position.
    let (sector, _) = resolve(&disk, &volume, &stream, &mut cursor, 2).unwrap();
    assert_eq!(sector, volume.cluster_to_sector(70).unwrap());

    // Going backwards restarts from the head rather than the cursor.
    let (sector, _) = resolve(&disk, &volume, &stream, &mut cursor, 0).unwrap();
    assert_eq!(sector, volume.cluster_to_sector(50).unwrap());
}

#[test]
fn contiguous_fat_chain_reports_a_batched_run() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    set_fat_entry(&disk, &volume, 50, 51).unwrap();
    set_fat_entry(&disk, &volume, 51, 52).unwrap();
    set_fat_entry(&disk, &volume, 52, FAT_EOC).unwrap();

    let stream = StreamView {
        first_cluster: 50,
        data_length: 3 * volume.cluster_size() as u64,
        no_fat_chain: false,
    };
    let mut cursor = ChainCursor::new();
    let (sector, run) = resolve(&disk, &volume, &stream, &mut cursor, 0).unwrap();
    assert_eq!(sector, volume.cluster_to_sector(50).unwrap());
    assert_eq!(run, 3);
}

#[test]
fn chain_walks_terminate_on_cycles() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    set_fat_entry(&disk, &volume, 80, 81).unwrap();
    set_fat_entry(&disk, &volume, 81, 80).unwrap();
    assert_eq!(collect_chain(&disk, &volume, 80), Err(Error::ChainCycle));

    set_fat_entry(&disk, &volume, 90, FAT_EOC).unwrap();
    assert_eq!(collect_chain(&disk, &volume, 90).unwrap(), vec![90]);
}

#[test]
fn bad_fat_values_abort_the_walk() {
    let disk = RamDisk::new(4096);
    let volume = test_volume(1024);
    // A free slot in the middle of a chain is a consistency violation.
    set_fat_entry(&disk, &volume, 100, 101).unwrap();
    assert!(matches!(
        collect_chain(&disk, &volume, 100),
        Err(Error::InvalidCluster(_))
    ));
}
