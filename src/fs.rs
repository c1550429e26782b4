//! The mounted-filesystem facade: boot codec, allocator, chain resolver
//! and entry codec wired together for ordinary runtime use. Callers
//! wanting concurrency wrap the whole instance in a lock.

use std::sync::Arc;

use crate::bitmap::{AllocStrategy, Allocator};
use crate::block_dev::BlockDevice;
use crate::boot;
use crate::chain::{ChainCursor, StreamView};
use crate::config::*;
use crate::dirent::{self, BitmapEntry, EntrySet};
use crate::error::{FsError, Result};
use crate::fat;
use crate::file;
use crate::source::ChainSource;
use crate::upcase::{self, UpcaseEntry};
use crate::volume::{ClusterId, Volume};

pub struct ExFat<D: BlockDevice> {
    device: Arc<D>,
    volume: Volume,
    allocator: Allocator<ChainSource>,
    bitmap_entry: BitmapEntry,
    upcase_entry: UpcaseEntry,
    label: Option<String>,
    /// Rotating allocation hint: one past the last cluster handed out.
    next_hint: ClusterId,
}

impl<D: BlockDevice> ExFat<D> {
    /// Mounts a volume: loads the boot region (falling back to the
    /// backup), locates the allocation bitmap and up-case table in the
    /// root directory, and scans the bitmap once.
    pub fn mount(device: Arc<D>, strategy: AllocStrategy) -> Result<Self> {
        let volume = boot::read_boot(&*device)?;
        let root = Self::root_stream(&volume);
        let (bytes, _clusters) = file::read_stream_clusters(&*device, &volume, &root)?;
        let scan = dirent::scan_directory(&bytes);

        let bitmap_entry = scan
            .bitmaps
            .iter()
            .find(|(_, b)| b.which == 0)
            .map(|&(_, b)| b)
            .ok_or(FsError::MissingMetadata)?;
        let upcase_entry = scan
            .upcase
            .map(|(_, e)| e)
            .ok_or(FsError::MissingMetadata)?;

        let bitmap_stream = StreamView {
            first_cluster: bitmap_entry.first_cluster,
            data_length: bitmap_entry.data_length,
            no_fat_chain: false,
        };
        let allocator = Allocator::init(
            &*device,
            &volume,
            ChainSource::new(bitmap_stream),
            strategy,
        )?;

        Ok(Self {
            device,
            volume,
            allocator,
            bitmap_entry,
            upcase_entry,
            label: scan.label,
            next_hint: FIRST_CLUSTER,
        })
    }

    fn root_stream(volume: &Volume) -> StreamView {
        StreamView {
            first_cluster: volume.first_root_cluster,
            data_length: 0,
            no_fat_chain: false,
        }
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn free_clusters(&self) -> u32 {
        self.allocator.free_clusters()
    }

    pub fn bitmap_entry(&self) -> &BitmapEntry {
        &self.bitmap_entry
    }

    pub fn upcase_entry(&self) -> &UpcaseEntry {
        &self.upcase_entry
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    /// All entry sets of the directory at `path`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<EntrySet>> {
        let stream = self.resolve_dir(path)?;
        let (bytes, _) = file::read_stream_clusters(&*self.device, &self.volume, &stream)?;
        Ok(dirent::scan_directory(&bytes)
            .sets
            .into_iter()
            .map(|(_, set)| set)
            .collect())
    }

    /// Resolves a path to its entry set. Comparison is case-insensitive
    /// through the up-case mapping.
    pub fn lookup(&self, path: &str) -> Result<EntrySet> {
        let (parent, name) = self.resolve_parent(path)?;
        let (_, _, set) = self.find_in_dir(&parent, &name)?;
        Ok(set)
    }

    /// Reads file bytes at `offset`. The range must lie inside the file.
    pub fn read(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let set = self.lookup(path)?;
        if set.is_directory() {
            return Err(FsError::NotFile);
        }
        let stream = set.stream();
        let mut cursor = ChainCursor::new();
        file::read_stream(&*self.device, &self.volume, &stream, &mut cursor, offset, buf)
    }

    /// Creates a regular file holding `data`, allocating and chaining
    /// its clusters through the FAT.
    pub fn create(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.find_in_dir(&parent, &name).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let first = self.write_new_chain(data)?;
        let set = EntrySet::new(&name, ATTR_ARCHIVE, first, data.len() as u64, false)?;
        self.insert_set(&parent, &set)
    }

    /// Creates an empty subdirectory (one zeroed cluster).
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.find_in_dir(&parent, &name).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let cluster = self.allocate_next()?;
        fat::set_fat_entry(&*self.device, &self.volume, cluster, FAT_EOC)?;
        file::write_cluster(&*self.device, &self.volume, cluster, &[])?;
        let set = EntrySet::new(
            &name,
            ATTR_DIRECTORY,
            cluster,
            self.volume.cluster_size() as u64,
            false,
        )?;
        self.insert_set(&parent, &set)
    }

    /// Removes a file or an empty directory: marks its records deleted
    /// and releases its clusters.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let (dir_clusters, offset, set) = self.find_in_dir(&parent, &name)?;
        if set.is_directory() {
            let (bytes, _) =
                file::read_stream_clusters(&*self.device, &self.volume, &set.stream())?;
            if !dirent::scan_directory(&bytes).sets.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }

        // Mark every record of the set deleted.
        let cluster_size = self.volume.cluster_size();
        for rec in 0..set.record_count() {
            let at = offset + rec * DIRENT_SIZE;
            let cluster = dir_clusters[at / cluster_size];
            let within = at % cluster_size;
            let mut data = file::read_cluster(&*self.device, &self.volume, cluster)?;
            data[within] &= !ENTRY_INUSE_BIT;
            file::write_cluster(&*self.device, &self.volume, cluster, &data)?;
        }

        for cluster in
            crate::chain::stream_clusters(&*self.device, &self.volume, &set.stream())?
        {
            self.allocator
                .deallocate(&*self.device, &self.volume, cluster)?;
            if !set.no_fat_chain {
                fat::set_fat_entry(&*self.device, &self.volume, cluster, FAT_FREE)?;
            }
        }
        Ok(())
    }

    /// Rewrites the percent-in-use byte of both boot sectors and flushes
    /// the device. The byte is outside the boot checksum, so the regions
    /// stay valid.
    pub fn unmount(self) -> Result<()> {
        let percent = self.allocator.percent_in_use(&self.volume);
        let sector_size = self.volume.sector_size();
        let mut buf = vec![0u8; sector_size];
        for base in [0u64, BACKUP_BOOT_SECTOR] {
            self.device.read_sector(base, &mut buf)?;
            buf[112] = percent;
            self.device.write_sector(base, &buf)?;
        }
        self.device.flush()
    }

    /// Allocates one cluster at the rotating hint, wrapping manually so
    /// the allocator always sees a valid hint.
    fn allocate_next(&mut self) -> Result<ClusterId> {
        if !self.volume.is_valid_cluster(self.next_hint) {
            self.next_hint = FIRST_CLUSTER;
        }
        let cluster = self
            .allocator
            .allocate(&*self.device, &self.volume, self.next_hint)?;
        self.next_hint = cluster + 1;
        Ok(cluster)
    }

    /// Allocates, chains and fills the clusters for `data`, returning
    /// the first cluster (0 for empty data).
    fn write_new_chain(&mut self, data: &[u8]) -> Result<ClusterId> {
        if data.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.volume.cluster_size();
        let mut first = 0;
        let mut prev = 0;
        for piece in data.chunks(cluster_size) {
            let cluster = self.allocate_next()?;
            if prev == 0 {
                first = cluster;
            } else {
                fat::set_fat_entry(&*self.device, &self.volume, prev, cluster)?;
            }
            fat::set_fat_entry(&*self.device, &self.volume, cluster, FAT_EOC)?;
            file::write_cluster(&*self.device, &self.volume, cluster, piece)?;
            prev = cluster;
        }
        Ok(first)
    }

    /// Splits a path into its parent directory stream and leaf name.
    fn resolve_parent(&self, path: &str) -> Result<(StreamView, String)> {
        let mut components: Vec<&str> =
            path.split('/').filter(|s| !s.is_empty()).collect();
        let name = components.pop().ok_or(FsError::InvalidFileName)?;
        let mut dir = Self::root_stream(&self.volume);
        for component in components {
            let (_, _, set) = self.find_in_dir(&dir, component)?;
            if !set.is_directory() {
                return Err(FsError::NotDirectory);
            }
            dir = set.stream();
        }
        Ok((dir, name.to_string()))
    }

    /// Resolves a path to a directory stream ("/" is the root).
    fn resolve_dir(&self, path: &str) -> Result<StreamView> {
        let mut dir = Self::root_stream(&self.volume);
        for component in path.split('/').filter(|s| !s.is_empty()) {
            let (_, _, set) = self.find_in_dir(&dir, component)?;
            if !set.is_directory() {
                return Err(FsError::NotDirectory);
            }
            dir = set.stream();
        }
        Ok(dir)
    }

    /// Finds a named set in a directory, returning the directory's
    /// clusters and the set's byte offset for in-place updates.
    fn find_in_dir(
        &self,
        dir: &StreamView,
        name: &str,
    ) -> Result<(Vec<ClusterId>, usize, EntrySet)> {
        let (bytes, clusters) =
            file::read_stream_clusters(&*self.device, &self.volume, dir)?;
        for (offset, set) in dirent::scan_directory(&bytes).sets {
            if set.name_matches(name) {
                return Ok((clusters, offset, set));
            }
        }
        Err(FsError::NotFound)
    }

    /// Writes a set's records into the first free run of record slots,
    /// extending the directory by one cluster when none is large enough.
    fn insert_set(&mut self, dir: &StreamView, set: &EntrySet) -> Result<()> {
        let image = dirent::encode_set(set);
        let records = set.record_count();
        let (bytes, mut clusters) =
            file::read_stream_clusters(&*self.device, &self.volume, dir)?;

        let (found, tail_start) = find_free_records(&bytes, records);
        let offset = match found {
            Some(offset) => offset,
            None => {
                // Grow the directory; the new set starts at the free
                // tail and may span into the fresh clusters.
                let cluster_size = self.volume.cluster_size();
                let overflow = tail_start + image.len() - bytes.len();
                for _ in 0..overflow.div_ceil(cluster_size) {
                    let cluster = self.allocate_next()?;
                    let last = *clusters.last().ok_or(FsError::NotDirectory)?;
                    fat::set_fat_entry(&*self.device, &self.volume, last, cluster)?;
                    fat::set_fat_entry(&*self.device, &self.volume, cluster, FAT_EOC)?;
                    file::write_cluster(&*self.device, &self.volume, cluster, &[])?;
                    clusters.push(cluster);
                }
                tail_start
            }
        };

        // Write the records through the directory's clusters.
        let cluster_size = self.volume.cluster_size();
        let mut written = 0usize;
        while written < image.len() {
            let at = offset + written;
            let cluster = clusters[at / cluster_size];
            let within = at % cluster_size;
            let take = (cluster_size - within).min(image.len() - written);
            let mut data = file::read_cluster(&*self.device, &self.volume, cluster)?;
            data[within..within + take].copy_from_slice(&image[written..written + take]);
            file::write_cluster(&*self.device, &self.volume, cluster, &data)?;
            written += take;
        }
        Ok(())
    }
}

/// Looks for `count` consecutive free record slots (deleted or in the
/// end-of-directory region). Returns the found offset, if any, plus the
/// offset where the directory's free tail begins so a caller extending
/// the stream knows where the next set must start.
fn find_free_records(buf: &[u8], count: usize) -> (Option<usize>, usize) {
    let total = buf.len() / DIRENT_SIZE;
    let mut run_start = 0usize;
    let mut run_len = 0usize;
    let mut idx = 0usize;
    while idx < total {
        let etype = buf[idx * DIRENT_SIZE];
        if etype == ENTRY_EOD {
            // Everything from here on is free.
            let start = if run_len > 0 { run_start } else { idx * DIRENT_SIZE };
            let available = buf.len() - start;
            return ((available >= count * DIRENT_SIZE).then_some(start), start);
        }
        if etype & ENTRY_INUSE_BIT == 0 {
            if run_len == 0 {
                run_start = idx * DIRENT_SIZE;
            }
            run_len += 1;
            if run_len == count {
                return (Some(run_start), buf.len());
            }
            idx += 1;
        } else {
            run_len = 0;
            // Skip a whole set in one step so its secondaries are not
            // misread as free slots.
            if etype == ENTRY_FILE && idx + 1 < total {
                let secondaries = buf[idx * DIRENT_SIZE + 1] as usize;
                idx += 1 + secondaries;
            } else {
                idx += 1;
            }
        }
    }
    (None, buf.len())
}

/// Verifies the on-disk up-case table against the checksum recorded in
/// its root directory entry.
pub fn verify_upcase_table(
    device: &impl BlockDevice,
    volume: &Volume,
    entry: &UpcaseEntry,
) -> Result<bool> {
    let stream = StreamView {
        first_cluster: entry.first_cluster,
        data_length: entry.data_length,
        no_fat_chain: false,
    };
    let (data, _) = file::read_stream_clusters(device, volume, &stream)?;
    let table = &data[..(entry.data_length as usize).min(data.len())];
    Ok(upcase::table_checksum(table) == entry.table_checksum)
}
