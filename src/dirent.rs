//! Directory entry codec. A directory is a stream of fixed 32-byte
//! records. Ordinary files span a checksummed set: one File record,
//! one Stream-Extension record, then enough File-Name records for the
//! name. The root directory additionally carries three single-record
//! critical primaries (volume label, allocation bitmap, up-case table)
//! that are not part of any checksummed set.

use crate::chain::StreamView;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::upcase::{UpcaseEntry, upcase_char};
use crate::volume::ClusterId;

/// A decoded (or to-be-encoded) directory entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySet {
    pub name: String,
    pub attributes: u16,
    pub secondary_count: u8,
    pub set_checksum: u16,
    pub first_cluster: ClusterId,
    pub data_length: u64,
    pub valid_data_length: u64,
    pub no_fat_chain: bool,
    pub name_hash: u16,
}

impl EntrySet {
    /// Builds a set with every derived field (secondary count, name
    /// hash, set checksum) computed from the inputs.
    pub fn new(
        name: &str,
        attributes: u16,
        first_cluster: ClusterId,
        data_length: u64,
        no_fat_chain: bool,
    ) -> Result<Self> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.is_empty() || units.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidFileName);
        }
        let name_records = units.len().div_ceil(NAME_CHARS_PER_ENTRY);
        let mut set = Self {
            name: name.to_string(),
            attributes,
            secondary_count: (1 + name_records) as u8,
            set_checksum: 0,
            first_cluster,
            data_length,
            valid_data_length: data_length,
            no_fat_chain,
            name_hash: name_hash(&units),
        };
        let image = encode_set(&set);
        set.set_checksum = u16::from_le_bytes([image[2], image[3]]);
        Ok(set)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    /// Number of 32-byte records the set occupies on disk.
    pub fn record_count(&self) -> usize {
        1 + self.secondary_count as usize
    }

    pub fn stream(&self) -> StreamView {
        StreamView {
            first_cluster: self.first_cluster,
            data_length: self.data_length,
            no_fat_chain: self.no_fat_chain,
        }
    }

    /// Case-insensitive name comparison, the way lookup hashes compare.
    pub fn name_matches(&self, other: &str) -> bool {
        let a: Vec<u16> = self.name.encode_utf16().map(upcase_char).collect();
        let b: Vec<u16> = other.encode_utf16().map(upcase_char).collect();
        a == b
    }
}

/// 16-bit rotate-right-and-add checksum over a full set image, skipping
/// the primary's own checksum field bytes. The skip list is literal
/// format law.
pub fn entry_set_checksum(image: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for (i, &byte) in image.iter().enumerate() {
        if SET_CHECKSUM_SKIP.contains(&i) {
            continue;
        }
        checksum = checksum.rotate_right(1).wrapping_add(byte as u16);
    }
    checksum
}

/// Case-insensitive hash of a UTF-16 name, stored in the
/// Stream-Extension record and checked on decode.
pub fn name_hash(units: &[u16]) -> u16 {
    let mut hash: u16 = 0;
    for &ch in units {
        let up = upcase_char(ch);
        hash = hash.rotate_right(1).wrapping_add(up & 0xFF);
        hash = hash.rotate_right(1).wrapping_add(up >> 8);
    }
    hash
}

/// Lays out a set as its on-disk records and stamps the checksum.
pub fn encode_set(set: &EntrySet) -> Vec<u8> {
    let units: Vec<u16> = set.name.encode_utf16().collect();
    let name_records = units.len().div_ceil(NAME_CHARS_PER_ENTRY);
    let records = 2 + name_records;
    let mut image = vec![0u8; records * DIRENT_SIZE];

    // File record.
    image[0] = ENTRY_FILE;
    image[1] = (1 + name_records) as u8;
    image[4..6].copy_from_slice(&set.attributes.to_le_bytes());

    // Stream-Extension record.
    let s = DIRENT_SIZE;
    image[s] = ENTRY_STREAM;
    let mut flags = STREAM_ALLOC_POSSIBLE;
    if set.no_fat_chain {
        flags |= STREAM_NO_FAT_CHAIN;
    }
    image[s + 1] = flags;
    image[s + 3] = units.len() as u8;
    image[s + 4..s + 6].copy_from_slice(&name_hash(&units).to_le_bytes());
    image[s + 8..s + 16].copy_from_slice(&set.valid_data_length.to_le_bytes());
    image[s + 20..s + 24].copy_from_slice(&set.first_cluster.to_le_bytes());
    image[s + 24..s + 32].copy_from_slice(&set.data_length.to_le_bytes());

    // File-Name records, 15 code units each, zero padded.
    for rec in 0..name_records {
        let f = (2 + rec) * DIRENT_SIZE;
        image[f] = ENTRY_FILENAME;
        for slot in 0..NAME_CHARS_PER_ENTRY {
            let i = rec * NAME_CHARS_PER_ENTRY + slot;
            let ch = units.get(i).copied().unwrap_or(0);
            let at = f + 2 + slot * 2;
            image[at..at + 2].copy_from_slice(&ch.to_le_bytes());
        }
    }

    let checksum = entry_set_checksum(&image);
    image[2..4].copy_from_slice(&checksum.to_le_bytes());
    image
}

/// Decodes the entry set starting at `offset`, returning it and the
/// offset of the record right after it. Any structural violation or a
/// checksum/name-hash mismatch invalidates the whole candidate.
pub fn decode_set(buf: &[u8], offset: usize) -> Result<(EntrySet, usize)> {
    let rec = record(buf, offset)?;
    if rec[0] != ENTRY_FILE {
        return Err(FsError::InvalidEntrySet);
    }
    let secondary_count = rec[1] as usize;
    if secondary_count < 2 {
        return Err(FsError::InvalidEntrySet);
    }
    let total = 1 + secondary_count;
    if offset + total * DIRENT_SIZE > buf.len() {
        return Err(FsError::InvalidEntrySet);
    }
    let image = &buf[offset..offset + total * DIRENT_SIZE];
    let stored_checksum = u16::from_le_bytes([image[2], image[3]]);
    if entry_set_checksum(image) != stored_checksum {
        return Err(FsError::InvalidEntrySet);
    }

    let attributes = u16::from_le_bytes([image[4], image[5]]);

    let s = DIRENT_SIZE;
    if image[s] != ENTRY_STREAM {
        return Err(FsError::InvalidEntrySet);
    }
    let flags = image[s + 1];
    let name_length = image[s + 3] as usize;
    let stored_hash = u16::from_le_bytes([image[s + 4], image[s + 5]]);
    let valid_data_length = u64::from_le_bytes(image[s + 8..s + 16].try_into().unwrap());
    let first_cluster = u32::from_le_bytes(image[s + 20..s + 24].try_into().unwrap());
    let data_length = u64::from_le_bytes(image[s + 24..s + 32].try_into().unwrap());

    if name_length == 0 || name_length > MAX_NAME_LEN {
        return Err(FsError::InvalidEntrySet);
    }
    let name_records = name_length.div_ceil(NAME_CHARS_PER_ENTRY);
    if name_records != secondary_count - 1 {
        return Err(FsError::InvalidEntrySet);
    }
    if valid_data_length > data_length {
        return Err(FsError::InvalidEntrySet);
    }

    let mut units = Vec::with_capacity(name_length);
    for rec_idx in 0..name_records {
        let f = (2 + rec_idx) * DIRENT_SIZE;
        if image[f] != ENTRY_FILENAME {
            return Err(FsError::InvalidEntrySet);
        }
        for slot in 0..NAME_CHARS_PER_ENTRY {
            if units.len() == name_length {
                break;
            }
            let at = f + 2 + slot * 2;
            units.push(u16::from_le_bytes([image[at], image[at + 1]]));
        }
    }
    if name_hash(&units) != stored_hash {
        return Err(FsError::InvalidEntrySet);
    }
    let name = String::from_utf16(&units).map_err(|_| FsError::InvalidEntrySet)?;

    let set = EntrySet {
        name,
        attributes,
        secondary_count: secondary_count as u8,
        set_checksum: stored_checksum,
        first_cluster,
        data_length,
        valid_data_length,
        no_fat_chain: flags & STREAM_NO_FAT_CHAIN != 0,
        name_hash: stored_hash,
    };
    Ok((set, offset + total * DIRENT_SIZE))
}

/// The allocation bitmap's location, from its root directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapEntry {
    pub first_cluster: ClusterId,
    pub data_length: u64,
    /// 0 = first bitmap, 1 = second (one per FAT copy).
    pub which: u8,
}

/// Everything found in one scan of a directory stream.
#[derive(Debug, Default)]
pub struct DirScan {
    /// Valid entry sets with the byte offset of their File record.
    pub sets: Vec<(usize, EntrySet)>,
    pub bitmaps: Vec<(usize, BitmapEntry)>,
    pub upcase: Option<(usize, UpcaseEntry)>,
    pub label: Option<String>,
    /// Candidate sets discarded for failing validation.
    pub invalid_sets: u32,
}

/// Scans a directory stream record by record. Deleted records are
/// skipped, an end-of-directory marker stops the scan, and a candidate
/// set that fails validation is discarded wholesale with the scan
/// resuming right after its File record.
pub fn scan_directory(buf: &[u8]) -> DirScan {
    let mut scan = DirScan::default();
    let mut offset = 0;
    while offset + DIRENT_SIZE <= buf.len() {
        let etype = buf[offset];
        if etype == ENTRY_EOD {
            break;
        }
        if etype & ENTRY_INUSE_BIT == 0 {
            offset += DIRENT_SIZE;
            continue;
        }
        match etype {
            ENTRY_FILE => match decode_set(buf, offset) {
                Ok((set, next)) => {
                    scan.sets.push((offset, set));
                    offset = next;
                }
                Err(_) => {
                    scan.invalid_sets += 1;
                    offset += DIRENT_SIZE;
                }
            },
            ENTRY_BITMAP => {
                let rec = &buf[offset..offset + DIRENT_SIZE];
                scan.bitmaps.push((
                    offset,
                    BitmapEntry {
                        first_cluster: u32::from_le_bytes(rec[20..24].try_into().unwrap()),
                        data_length: u64::from_le_bytes(rec[24..32].try_into().unwrap()),
                        which: rec[1] & 0x01,
                    },
                ));
                offset += DIRENT_SIZE;
            }
            ENTRY_UPCASE => {
                let rec = &buf[offset..offset + DIRENT_SIZE];
                scan.upcase = Some((
                    offset,
                    UpcaseEntry {
                        table_checksum: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
                        first_cluster: u32::from_le_bytes(rec[20..24].try_into().unwrap()),
                        data_length: u64::from_le_bytes(rec[24..32].try_into().unwrap()),
                    },
                ));
                offset += DIRENT_SIZE;
            }
            ENTRY_LABEL => {
                let rec = &buf[offset..offset + DIRENT_SIZE];
                let count = (rec[1] as usize).min(LABEL_CHARS);
                let mut units = Vec::with_capacity(count);
                for i in 0..count {
                    units.push(u16::from_le_bytes([rec[2 + i * 2], rec[3 + i * 2]]));
                }
                scan.label = String::from_utf16(&units).ok();
                offset += DIRENT_SIZE;
            }
            _ => {
                // Stray secondary or unknown benign record.
                offset += DIRENT_SIZE;
            }
        }
    }
    scan
}

fn record(buf: &[u8], offset: usize) -> Result<&[u8]> {
    if offset + DIRENT_SIZE > buf.len() {
        return Err(FsError::InvalidEntrySet);
    }
    Ok(&buf[offset..offset + DIRENT_SIZE])
}

pub fn encode_bitmap_entry(entry: &BitmapEntry) -> [u8; DIRENT_SIZE] {
    let mut rec = [0u8; DIRENT_SIZE];
    rec[0] = ENTRY_BITMAP;
    rec[1] = entry.which & 0x01;
    rec[20..24].copy_from_slice(&entry.first_cluster.to_le_bytes());
    rec[24..32].copy_from_slice(&entry.data_length.to_le_bytes());
    rec
}

pub fn encode_upcase_entry(entry: &UpcaseEntry) -> [u8; DIRENT_SIZE] {
    let mut rec = [0u8; DIRENT_SIZE];
    rec[0] = ENTRY_UPCASE;
    rec[4..8].copy_from_slice(&entry.table_checksum.to_le_bytes());
    rec[20..24].copy_from_slice(&entry.first_cluster.to_le_bytes());
    rec[24..32].copy_from_slice(&entry.data_length.to_le_bytes());
    rec
}

pub fn encode_label_entry(label: &str) -> Result<[u8; DIRENT_SIZE]> {
    let units: Vec<u16> = label.encode_utf16().collect();
    if units.len() > LABEL_CHARS {
        return Err(FsError::InvalidFileName);
    }
    let mut rec = [0u8; DIRENT_SIZE];
    rec[0] = ENTRY_LABEL;
    rec[1] = units.len() as u8;
    for (i, &ch) in units.iter().enumerate() {
        rec[2 + i * 2..4 + i * 2].copy_from_slice(&ch.to_le_bytes());
    }
    Ok(rec)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_round_trip() {
        let set = EntrySet::new("TEST.TXT", ATTR_ARCHIVE, 50, 4096, true).unwrap();
        let image = encode_set(&set);
        let (decoded, next) = decode_set(&image, 0).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(next, image.len());
    }

    #[test]
    fn long_name_spans_records() {
        let name = "a".repeat(40); // 3 File-Name records
        let set = EntrySet::new(&name, ATTR_ARCHIVE, 9, 100, false).unwrap();
        assert_eq!(set.secondary_count, 4);
        let image = encode_set(&set);
        assert_eq!(image.len(), 5 * DIRENT_SIZE);
        let (decoded, _) = decode_set(&image, 0).unwrap();
        assert_eq!(decoded.name, name);
    }

    #[test]
    fn any_single_byte_flip_invalidates() {
        let set = EntrySet::new("TEST.TXT", ATTR_ARCHIVE, 50, 4096, true).unwrap();
        let image = encode_set(&set);
        for i in 0..image.len() {
            let mut corrupt = image.clone();
            corrupt[i] ^= 0x40;
            assert!(
                decode_set(&corrupt, 0).is_err(),
                "flip at byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn checksum_is_deterministic() {
        let set = EntrySet::new("TEST.TXT", ATTR_ARCHIVE, 50, 4096, true).unwrap();
        let a = encode_set(&set);
        let b = encode_set(&set);
        assert_eq!(a, b);
        assert_eq!(set.set_checksum, u16::from_le_bytes([a[2], a[3]]));
        assert_ne!(set.set_checksum, 0);
    }

    #[test]
    fn name_hash_is_case_insensitive() {
        let a: Vec<u16> = "ReadMe.md".encode_utf16().collect();
        let b: Vec<u16> = "README.MD".encode_utf16().collect();
        assert_eq!(name_hash(&a), name_hash(&b));
    }

    #[test]
    fn scan_skips_deleted_and_stops_at_eod() {
        let set = EntrySet::new("KEEP.BIN", ATTR_ARCHIVE, 7, 10, false).unwrap();
        let gone = EntrySet::new("GONE.BIN", ATTR_ARCHIVE, 8, 10, false).unwrap();
        let mut dir = Vec::new();
        let mut deleted = encode_set(&gone);
        for rec in deleted.chunks_exact_mut(DIRENT_SIZE) {
            rec[0] &= !ENTRY_INUSE_BIT;
        }
        dir.extend_from_slice(&deleted);
        dir.extend_from_slice(&encode_set(&set));
        dir.resize(dir.len() + 2 * DIRENT_SIZE, 0); // end-of-directory
        dir.extend_from_slice(&encode_set(&gone)); // past EOD, ignored

        let scan = scan_directory(&dir);
        assert_eq!(scan.sets.len(), 1);
        assert_eq!(scan.sets[0].1.name, "KEEP.BIN");
        assert_eq!(scan.invalid_sets, 0);
    }

    #[test]
    fn corrupt_set_is_discarded_and_scan_resumes() {
        let bad = EntrySet::new("BAD.DAT", ATTR_ARCHIVE, 9, 10, false).unwrap();
        let good = EntrySet::new("GOOD.DAT", ATTR_ARCHIVE, 10, 10, false).unwrap();
        let mut dir = encode_set(&bad);
        let corrupt_at = DIRENT_SIZE + 20; // first cluster of the stream record
        dir[corrupt_at] ^= 0xFF;
        dir.extend_from_slice(&encode_set(&good));

        let scan = scan_directory(&dir);
        assert_eq!(scan.invalid_sets, 1);
        assert_eq!(scan.sets.len(), 1);
        assert_eq!(scan.sets[0].1.name, "GOOD.DAT");
    }
}
