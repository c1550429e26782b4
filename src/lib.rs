//! An exFAT on-disk filesystem engine: boot sector codec, cluster
//! allocation bitmap, FAT chain resolver, directory entry set codec,
//! volume builder and multi-pass consistency checker.
//!
//! Volume layout (all offsets in sectors):
//! - Boot region (12 sectors) + backup boot region (12 sectors)
//! - FAT (1 or 2 copies)
//! - Cluster heap, holding the allocation bitmap file, the up-case
//!   table, the root directory and all file data
//!
//! The engine's layers (from bottom to top):
//! 1. Block Device: sector store abstraction.                 User implemented (hardware / cache)
//! 2. Boot Sector Codec + Volume: geometry and invariants.    Fs implemented
//! 3. FAT + Chain Resolver: logical-to-physical mapping.      Fs implemented
//! 4. Allocation Bitmap: free space management.               Fs implemented
//! 5. Directory Entry Codec: checksummed entry sets.          Fs implemented
//! 6. ExFat facade / Builder / Checker: user entry points.    Fs implemented

mod bitmap;
mod block_dev;
mod boot;
mod build;
mod chain;
mod check;
mod config;
mod dirent;
mod error;
mod fat;
mod file;
mod fs;
mod source;
mod upcase;
mod volume;

pub use bitmap::{AllocStrategy, Allocator};
pub use block_dev::BlockDevice;
pub use boot::{boot_region_checksum, read_boot, write_boot_region};
pub use build::{BuildParams, build};
pub use chain::{ChainCursor, StreamView, collect_chain, resolve, stream_clusters};
pub use check::{CheckOptions, CheckReport, Defect, check};
pub use config::*;
pub use dirent::{
    BitmapEntry, DirScan, EntrySet, decode_set, encode_set, entry_set_checksum, name_hash,
    scan_directory,
};
pub use error::FsError as Error;
pub use error::{FsError, Result};
pub use fat::{fat_entry, next_in_chain, set_fat_entry};
pub use file::{read_cluster, read_stream, read_stream_clusters, write_cluster, write_stream};
pub use fs::{ExFat, verify_upcase_table};
pub use source::{BlockSource, ChainSource, RawRegion};
pub use upcase::{UpcaseEntry, default_table, table_bytes, table_checksum, upcase_char};
pub use volume::{ClusterId, Volume};
