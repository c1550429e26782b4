//! Cluster allocation bitmap. One bit per cluster, bit index
//! `cluster - 2`, persisted in the allocation bitmap file and reached
//! through a [`BlockSource`]. Two interchangeable search strategies sit
//! behind the same contract: a linear byte scan and a counting tree that
//! skips fully-used subranges and satisfies fully-free ones without
//! touching bitmap bytes. Pick one per mounted volume; never mix.

use crate::block_dev::BlockDevice;
use crate::config::FIRST_CLUSTER;
use crate::error::{FsError, Result};
use crate::source::BlockSource;
use crate::volume::{ClusterId, Volume};

/// Search strategy, chosen at volume-open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    Linear,
    CountingTree,
}

/// Index of the first clear bit in a byte, 8 when the byte is full.
const fn first_free_table() -> [u8; 256] {
    let mut table = [8u8; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut bit = 0;
        while bit < 8 {
            if byte & (1 << bit) == 0 {
                table[byte] = bit as u8;
                break;
            }
            bit += 1;
        }
        byte += 1;
    }
    table
}

const FIRST_FREE_BIT: [u8; 256] = first_free_table();

/// Children per counting-tree node.
const TREE_ARITY: u64 = 8;

#[derive(Debug)]
struct Node {
    /// Allocated clusters in this node's subrange.
    used: u32,
    /// Materialized only while the subrange is mixed; a homogeneous
    /// subrange (all free or all used) is represented by the count alone.
    children: Option<Vec<Node>>,
}

#[derive(Debug)]
struct CountTree {
    /// Bits covered by one leaf: one bitmap sector's worth.
    leaf_bits: u64,
    /// Bits covered by the root.
    root_span: u64,
    root: Node,
}

#[derive(Debug)]
enum StrategyState {
    Linear,
    CountingTree(CountTree),
}

/// Owns the free-cluster count and the strategy state; every mutation of
/// the persisted bitmap goes through here.
#[derive(Debug)]
pub struct Allocator<S: BlockSource> {
    source: S,
    free_clusters: u32,
    strategy: StrategyState,
}

impl<S: BlockSource> Allocator<S> {
    /// Full scan at mount time: computes the free count and, for the
    /// counting-tree strategy, the per-subrange used counts.
    pub fn init(
        device: &impl BlockDevice,
        volume: &Volume,
        mut source: S,
        strategy: AllocStrategy,
    ) -> Result<Self> {
        let sector_size = volume.sector_size();
        let total_bits = volume.cluster_count as u64;
        let bitmap_sectors = total_bits.div_ceil(8).div_ceil(sector_size as u64);
        if source.num_sectors(volume) < bitmap_sectors {
            return Err(FsError::InvalidGeometry);
        }

        let mut buf = vec![0u8; sector_size];
        let mut leaf_counts = Vec::with_capacity(bitmap_sectors as usize);
        let mut used_total: u64 = 0;
        for sector in 0..bitmap_sectors {
            source.read_sector(device, volume, sector, &mut buf)?;
            let base = sector * sector_size as u64 * 8;
            let mut used_here: u32 = 0;
            for (i, &byte) in buf.iter().enumerate() {
                let bit_base = base + i as u64 * 8;
                if bit_base >= total_bits {
                    break;
                }
                let valid = (total_bits - bit_base).min(8) as u32;
                let mask = if valid == 8 { 0xFF } else { (1u8 << valid) - 1 };
                used_here += (byte & mask).count_ones();
            }
            used_total += used_here as u64;
            leaf_counts.push(used_here);
        }

        let strategy = match strategy {
            AllocStrategy::Linear => StrategyState::Linear,
            AllocStrategy::CountingTree => StrategyState::CountingTree(CountTree::build(
                &leaf_counts,
                sector_size as u64 * 8,
                total_bits,
            )),
        };
        Ok(Self {
            source,
            free_clusters: (total_bits - used_total) as u32,
            strategy,
        })
    }

    pub fn free_clusters(&self) -> u32 {
        self.free_clusters
    }

    pub fn percent_in_use(&self, volume: &Volume) -> u8 {
        let used = volume.cluster_count - self.free_clusters;
        (used as u64 * 100 / volume.cluster_count as u64) as u8
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Returns the lowest-indexed free cluster at or after `start_hint`,
    /// wrapping to `[2, start_hint)` when the tail is exhausted, and
    /// marks it used before returning. A hint outside the valid cluster
    /// range is a caller bug, not a full volume.
    pub fn allocate(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        start_hint: ClusterId,
    ) -> Result<ClusterId> {
        if !volume.is_valid_cluster(start_hint) {
            return Err(FsError::InvalidCluster(start_hint));
        }
        let total = volume.cluster_count as u64;
        let hint_idx = (start_hint - FIRST_CLUSTER) as u64;

        let found = match &self.strategy {
            StrategyState::Linear => {
                match Self::scan_free(&mut self.source, device, volume, hint_idx, total)? {
                    Some(idx) => Some(idx),
                    None => Self::scan_free(&mut self.source, device, volume, 0, hint_idx)?,
                }
            }
            StrategyState::CountingTree(tree) => {
                match tree.find_free(&mut self.source, device, volume, hint_idx, total)? {
                    Some(idx) => Some(idx),
                    None => tree.find_free(&mut self.source, device, volume, 0, hint_idx)?,
                }
            }
        };
        let idx = found.ok_or(FsError::OutOfSpace)?;

        let prev = self.set_bit(device, volume, idx, true)?;
        debug_assert!(!prev, "search returned an allocated cluster");
        if let StrategyState::CountingTree(tree) = &mut self.strategy {
            tree.mark(idx, true);
        }
        self.free_clusters -= 1;
        Ok(idx as ClusterId + FIRST_CLUSTER)
    }

    /// Clears a cluster's bit. Deallocating a free cluster is a
    /// programming error, reported and left with no state change.
    pub fn deallocate(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        cluster: ClusterId,
    ) -> Result<()> {
        if !volume.is_valid_cluster(cluster) {
            return Err(FsError::InvalidCluster(cluster));
        }
        let idx = (cluster - FIRST_CLUSTER) as u64;
        let prev = self.set_bit(device, volume, idx, false)?;
        if !prev {
            debug_assert!(prev, "deallocating a free cluster");
            return Err(FsError::InvalidCluster(cluster));
        }
        if let StrategyState::CountingTree(tree) = &mut self.strategy {
            tree.mark(idx, false);
        }
        self.free_clusters += 1;
        Ok(())
    }

    /// Reads a cluster's bit without changing it.
    pub fn is_allocated(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        cluster: ClusterId,
    ) -> Result<bool> {
        if !volume.is_valid_cluster(cluster) {
            return Err(FsError::InvalidCluster(cluster));
        }
        let idx = (cluster - FIRST_CLUSTER) as u64;
        let sector_size = volume.sector_size() as u64;
        let mut buf = vec![0u8; sector_size as usize];
        self.source
            .read_sector(device, volume, idx / 8 / sector_size, &mut buf)?;
        let byte = (idx / 8 % sector_size) as usize;
        Ok(buf[byte] & (1 << (idx % 8)) != 0)
    }

    /// Read-modify-write of one bit; returns the previous value.
    fn set_bit(
        &mut self,
        device: &impl BlockDevice,
        volume: &Volume,
        idx: u64,
        value: bool,
    ) -> Result<bool> {
        let sector_size = volume.sector_size() as u64;
        let sector = idx / 8 / sector_size;
        let byte = (idx / 8 % sector_size) as usize;
        let bit = idx % 8;
        let mut buf = vec![0u8; sector_size as usize];
        self.source.read_sector(device, volume, sector, &mut buf)?;
        let prev = buf[byte] & (1 << bit) != 0;
        if prev != value {
            if value {
                buf[byte] |= 1 << bit;
            } else {
                buf[byte] &= !(1 << bit);
            }
            self.source.write_sector(device, volume, sector, &buf)?;
        }
        Ok(prev)
    }

    /// Linear scan for the first free bit in `[from, until)`.
    fn scan_free(
        source: &mut S,
        device: &impl BlockDevice,
        volume: &Volume,
        from: u64,
        until: u64,
    ) -> Result<Option<u64>> {
        if from >= until {
            return Ok(None);
        }
        let sector_bits = volume.sector_size() as u64 * 8;
        let mut buf = vec![0u8; volume.sector_size()];
        let mut sector = from / sector_bits;
        while sector * sector_bits < until {
            source.read_sector(device, volume, sector, &mut buf)?;
            if let Some(idx) = scan_sector(&buf, sector * sector_bits, from, until) {
                return Ok(Some(idx));
            }
            sector += 1;
        }
        Ok(None)
    }
}

/// Scans one bitmap sector for a free bit inside `[from, until)`.
fn scan_sector(buf: &[u8], base: u64, from: u64, until: u64) -> Option<u64> {
    let lo = from.max(base);
    let hi = until.min(base + buf.len() as u64 * 8);
    let mut bit = lo;
    while bit < hi {
        let byte_idx = ((bit - base) / 8) as usize;
        let mut byte = buf[byte_idx];
        // Mask off bits below the search start within this byte.
        byte |= (1u8 << (bit % 8)) - 1;
        let free = FIRST_FREE_BIT[byte as usize] as u64;
        if free < 8 {
            let idx = base + byte_idx as u64 * 8 + free;
            if idx < hi {
                return Some(idx);
            }
            return None;
        }
        bit = base + (byte_idx as u64 + 1) * 8;
    }
    None
}

impl CountTree {
    fn build(leaf_counts: &[u32], leaf_bits: u64, total_bits: u64) -> Self {
        let mut root_span = leaf_bits;
        while root_span < total_bits {
            root_span *= TREE_ARITY;
        }
        let root = Self::build_node(leaf_counts, 0, root_span, leaf_bits, total_bits);
        Self { leaf_bits, root_span, root }
    }

    fn build_node(
        leaf_counts: &[u32],
        lo: u64,
        span: u64,
        leaf_bits: u64,
        total_bits: u64,
    ) -> Node {
        let hi = (lo + span).min(total_bits);
        if hi <= lo {
            return Node { used: 0, children: None };
        }
        let capacity = hi - lo;
        if span == leaf_bits {
            let used = leaf_counts.get((lo / leaf_bits) as usize).copied().unwrap_or(0);
            return Node { used, children: None };
        }
        let child_span = span / TREE_ARITY;
        let children: Vec<Node> = (0..TREE_ARITY)
            .map(|i| {
                Self::build_node(leaf_counts, lo + i * child_span, child_span, leaf_bits, total_bits)
            })
            .collect();
        let used: u32 = children.iter().map(|c| c.used).sum();
        if used == 0 || used as u64 == capacity {
            // Homogeneous: the count alone describes the subrange.
            Node { used, children: None }
        } else {
            Node { used, children: Some(children) }
        }
    }

    /// First free bit in `[from, until)`, skipping full subranges and
    /// answering all-free subranges without reading bitmap bytes.
    fn find_free<S: BlockSource>(
        &self,
        source: &mut S,
        device: &impl BlockDevice,
        volume: &Volume,
        from: u64,
        until: u64,
    ) -> Result<Option<u64>> {
        let total = volume.cluster_count as u64;
        Self::find_in_node(
            &self.root,
            0,
            self.root_span,
            total,
            from,
            until.min(total),
            source,
            device,
            volume,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn find_in_node<S: BlockSource>(
        node: &Node,
        lo: u64,
        span: u64,
        total: u64,
        from: u64,
        until: u64,
        source: &mut S,
        device: &impl BlockDevice,
        volume: &Volume,
    ) -> Result<Option<u64>> {
        let hi = (lo + span).min(total).min(until);
        if hi <= lo || hi <= from {
            return Ok(None);
        }
        let capacity = (lo + span).min(total) - lo;
        if node.used as u64 == capacity {
            return Ok(None);
        }
        if node.used == 0 {
            return Ok(Some(lo.max(from)));
        }
        if let Some(children) = &node.children {
            let child_span = span / TREE_ARITY;
            for (i, child) in children.iter().enumerate() {
                let child_lo = lo + i as u64 * child_span;
                if let Some(idx) = Self::find_in_node(
                    child, child_lo, child_span, total, from, until, source, device, volume,
                )? {
                    return Ok(Some(idx));
                }
            }
            return Ok(None);
        }
        // Mixed leaf: fall back to the byte scan of its bitmap sector.
        let sector_bits = volume.sector_size() as u64 * 8;
        let mut buf = vec![0u8; volume.sector_size()];
        let mut sector = lo.max(from) / sector_bits;
        while sector * sector_bits < hi {
            source.read_sector(device, volume, sector, &mut buf)?;
            if let Some(idx) = scan_sector(&buf, sector * sector_bits, lo.max(from), hi) {
                return Ok(Some(idx));
            }
            sector += 1;
        }
        Ok(None)
    }

    /// Propagates a single-bit change up to the root, materializing
    /// children the first time a homogeneous subrange turns mixed.
    fn mark(&mut self, idx: u64, value: bool) {
        Self::mark_node(&mut self.root, 0, self.root_span, self.leaf_bits, idx, value);
    }

    fn mark_node(node: &mut Node, lo: u64, span: u64, leaf_bits: u64, idx: u64, value: bool) {
        if span > leaf_bits {
            if node.children.is_none() {
                // Lazily materialize: children inherit the homogeneous
                // state the count describes.
                let child_span = span / TREE_ARITY;
                let all_used = node.used > 0;
                let children = (0..TREE_ARITY)
                    .map(|i| {
                        let child_lo = lo + i * child_span;
                        let used = if all_used {
                            // Tail children past the heap end hold 0.
                            child_capacity(child_lo, child_span, lo, node.used)
                        } else {
                            0
                        };
                        Node { used, children: None }
                    })
                    .collect();
                node.children = Some(children);
            }
            let child_span = span / TREE_ARITY;
            let slot = ((idx - lo) / child_span) as usize;
            if let Some(children) = &mut node.children {
                Self::mark_node(&mut children[slot], lo + slot as u64 * child_span, child_span, leaf_bits, idx, value);
            }
        }
        if value {
            node.used += 1;
        } else {
            node.used -= 1;
        }
    }
}

/// Capacity share of one child when splitting a fully-used node whose
/// range may be clipped by the end of the heap. `parent_used` equals the
/// parent's clipped capacity when this is called.
fn child_capacity(child_lo: u64, child_span: u64, parent_lo: u64, parent_used: u32) -> u32 {
    let parent_hi = parent_lo + parent_used as u64;
    let hi = (child_lo + child_span).min(parent_hi);
    hi.saturating_sub(child_lo).min(child_span) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_free_bit_table() {
        assert_eq!(FIRST_FREE_BIT[0x00], 0);
        assert_eq!(FIRST_FREE_BIT[0x01], 1);
        assert_eq!(FIRST_FREE_BIT[0b0000_0111], 3);
        assert_eq!(FIRST_FREE_BIT[0xFF], 8);
        assert_eq!(FIRST_FREE_BIT[0x7F], 7);
    }

    #[test]
    fn scan_sector_respects_window() {
        let mut buf = vec![0xFFu8; 512];
        buf[3] = 0b1100_1111; // bits 28, 29 free
        assert_eq!(scan_sector(&buf, 0, 0, 4096), Some(28));
        assert_eq!(scan_sector(&buf, 0, 29, 4096), Some(29));
        assert_eq!(scan_sector(&buf, 0, 30, 4096), None);
        // Window ends before the free bit.
        assert_eq!(scan_sector(&buf, 0, 0, 28), None);
    }
}
