//! Block-group bitmap allocator (`spec.md` §4.3 "Allocation").
//!
//! Inode and data-block bitmaps are reached through the reserved-inode
//! pseudo-files `IBITMAP_INO`/`DBITMAP_INO` via [`BgTable`], and bit-tested
//! in ext2's little-endian-within-byte order so an image stays readable by
//! ext2 tooling (`spec.md` §9 open question: resolved in favor of ext2
//! compatibility).

use std::sync::Arc;

use crate::bgtable::BgTable;
use crate::buffer::BufferCache;
use crate::error::{NvfuseError, Result};
use crate::param::{BITS_PER_BYTE, CLUSTER_SIZE, DBITMAP_INO, IBITMAP_INO};

const BITS_PER_CLUSTER: usize = CLUSTER_SIZE * BITS_PER_BYTE;

fn test_bit(bytes: &[u8], bit: usize) -> bool {
    bytes[bit / BITS_PER_BYTE] & (1 << (bit % BITS_PER_BYTE)) != 0
}

fn set_bit(bytes: &mut [u8], bit: usize) {
    bytes[bit / BITS_PER_BYTE] |= 1 << (bit % BITS_PER_BYTE);
}

fn clear_bit(bytes: &mut [u8], bit: usize) {
    bytes[bit / BITS_PER_BYTE] &= !(1 << (bit % BITS_PER_BYTE));
}

/// Scans and mutates the `IBITMAP_INO`/`DBITMAP_INO` pseudo-files on behalf
/// of the inode and block allocators. Holds no state of its own beyond the
/// handles it needs to reach the buffer cache and the block-group table;
/// the bitmaps themselves are the only durable allocation state.
pub struct BitmapAllocator {
    bg_table: Arc<BgTable>,
    bc: Arc<BufferCache>,
}

impl BitmapAllocator {
    pub fn new(bg_table: Arc<BgTable>, bc: Arc<BufferCache>) -> Self {
        Self { bg_table, bc }
    }

    /// Find the first clear bit in `[skip_bits, total_bits)`, set it, and
    /// return its index. `is_meta_ino` selects which pseudo-file's clusters
    /// to walk (`IBITMAP_INO` or `DBITMAP_INO`); `translate` resolves a
    /// `(bg, cluster_offset)` pair to the physical cluster holding that
    /// slice of the bitmap.
    #[allow(clippy::too_many_arguments)]
    fn find_and_set(
        &self,
        pseudo_ino: u32,
        bg: u32,
        total_bits: usize,
        skip_bits: usize,
        translate: impl Fn(&BgTable, u32, u64) -> Option<u64>,
    ) -> Result<Option<usize>> {
        let clusters = (total_bits + BITS_PER_CLUSTER - 1) / BITS_PER_CLUSTER;
        for cluster_idx in 0..clusters {
            let pno = translate(&self.bg_table, bg, cluster_idx as u64).ok_or(NvfuseError::Io)?;
            let lbn = (bg as u64 * clusters as u64 + cluster_idx as u64) as u32;
            let bh = self.bc.get_bh(pseudo_ino, lbn, pno, true, true)?;
            let base = cluster_idx * BITS_PER_CLUSTER;
            let lo = skip_bits.saturating_sub(base);
            let hi = (total_bits - base).min(BITS_PER_CLUSTER);
            if lo >= hi {
                continue;
            }
            let found = bh.write(|data| {
                for bit in lo..hi {
                    if !test_bit(data, bit) {
                        set_bit(data, bit);
                        return Some(bit);
                    }
                }
                None
            });
            if let Some(bit) = found {
                return Ok(Some(base + bit));
            }
        }
        Ok(None)
    }

    /// `lbn` keys the buffer cache, so it must be derived the same way
    /// [`find_and_set`] derives it for the same `(pseudo_ino, bg,
    /// cluster_idx)` — otherwise the same physical cluster ends up cached
    /// under two different keys and a write through one key goes unseen by
    /// the other.
    fn clear_at(
        &self,
        pseudo_ino: u32,
        bg: u32,
        total_bits: usize,
        local_bit: usize,
        translate: impl Fn(&BgTable, u32, u64) -> Option<u64>,
    ) -> Result<()> {
        let clusters = (total_bits + BITS_PER_CLUSTER - 1) / BITS_PER_CLUSTER;
        let cluster_idx = (local_bit / BITS_PER_CLUSTER) as u64;
        let pno = translate(&self.bg_table, bg, cluster_idx).ok_or(NvfuseError::Io)?;
        let lbn = (bg as u64 * clusters as u64 + cluster_idx) as u32;
        let bh = self.bc.get_bh(pseudo_ino, lbn, pno, true, true)?;
        let bit = local_bit % BITS_PER_CLUSTER;
        bh.write(|data| clear_bit(data, bit));
        Ok(())
    }

    /// Allocate one free inode, preferring `hint_bg` and then scanning every
    /// other group round-robin. Bit 0 of block group 0 is never handed out:
    /// it would back inode number 0, which `spec.md` §3 reserves to mean
    /// "free slot" in the inode table.
    pub fn alloc_inode(&self, hint_bg: u32) -> Result<u32> {
        let bg_count = self.bg_table.bg_count();
        if bg_count == 0 {
            return Err(NvfuseError::NoSpace);
        }
        let inodes_per_bg = self.bg_table.inner.read().inodes_per_bg as usize;
        for i in 0..bg_count {
            let bg = (hint_bg + i) % bg_count;
            let desc = match self.bg_table.descriptor(bg) {
                Some(d) => d,
                None => continue,
            };
            if desc.free_inodes == 0 {
                continue;
            }
            let skip = if bg == 0 { 1 } else { 0 };
            let found = self.find_and_set(IBITMAP_INO, bg, inodes_per_bg, skip, BgTable::translate_ibitmap)?;
            if let Some(local) = found {
                self.bg_table.with_descriptor_mut(bg, |d| d.free_inodes -= 1);
                return Ok(bg * inodes_per_bg as u32 + local as u32);
            }
        }
        Err(NvfuseError::NoSpace)
    }

    pub fn free_inode(&self, ino: u32) -> Result<()> {
        let inodes_per_bg = self.bg_table.inner.read().inodes_per_bg;
        let bg = ino / inodes_per_bg;
        let local = (ino % inodes_per_bg) as usize;
        self.clear_at(IBITMAP_INO, bg, inodes_per_bg as usize, local, BgTable::translate_ibitmap)?;
        self.bg_table.with_descriptor_mut(bg, |d| d.free_inodes += 1);
        Ok(())
    }

    /// Allocate up to `count` data blocks, preferring locality within
    /// `hint_bg` before spilling into other groups (`spec.md` §4.3
    /// "Locality"). Returns fewer than `count` blocks only once every group
    /// is exhausted; the caller decides whether a partial allocation is
    /// acceptable or must be rolled back as `ENOSPC`.
    pub fn alloc_blocks(&self, hint_bg: u32, count: usize) -> Result<Vec<u64>> {
        let bg_count = self.bg_table.bg_count();
        if bg_count == 0 {
            return Err(NvfuseError::NoSpace);
        }
        let blocks_per_bg = self.bg_table.inner.read().blocks_per_bg as usize;
        let mut out = Vec::with_capacity(count);
        'outer: for i in 0..bg_count {
            let bg = (hint_bg + i) % bg_count;
            loop {
                let desc = match self.bg_table.descriptor(bg) {
                    Some(d) => d,
                    None => break,
                };
                if desc.free_blocks == 0 {
                    break;
                }
                let start = desc.bd_next_block as usize % blocks_per_bg.max(1);
                let mut found = self.find_and_set(DBITMAP_INO, bg, blocks_per_bg, start, BgTable::translate_dbitmap)?;
                if found.is_none() && start > 0 {
                    found = self.find_and_set(DBITMAP_INO, bg, start, 0, BgTable::translate_dbitmap)?;
                }
                match found {
                    Some(local) => {
                        self.bg_table.with_descriptor_mut(bg, |d| {
                            d.free_blocks -= 1;
                            d.bd_next_block = (local as u32 + 1) % blocks_per_bg as u32;
                        });
                        out.push(bg as u64 * blocks_per_bg as u64 + local as u64);
                        if out.len() == count {
                            break 'outer;
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(out)
    }

    pub fn free_blocks(&self, bnos: &[u64]) -> Result<()> {
        let blocks_per_bg = self.bg_table.inner.read().blocks_per_bg as u64;
        for &bno in bnos {
            let bg = (bno / blocks_per_bg) as u32;
            let local = (bno % blocks_per_bg) as usize;
            self.clear_at(DBITMAP_INO, bg, blocks_per_bg as usize, local, BgTable::translate_dbitmap)?;
            self.bg_table.with_descriptor_mut(bg, |d| d.free_blocks += 1);
        }
        Ok(())
    }

    /// Resolve a global data block number (`bg * blocks_per_bg + local`, as
    /// returned by [`alloc_blocks`]) to the physical cluster holding it.
    pub fn bno_to_pno(&self, bno: u64) -> Option<u64> {
        let blocks_per_bg = self.bg_table.inner.read().blocks_per_bg as u64;
        let bg = (bno / blocks_per_bg) as u32;
        let local = (bno % blocks_per_bg) as u32;
        self.bg_table.data_pno(bg, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBackedDevice;
    use crate::layout::BgDescriptor;

    fn setup() -> (Arc<BgTable>, Arc<BufferCache>) {
        let dir = tempfile::tempdir().unwrap();
        let dev: Arc<dyn crate::device::BlockDevice> =
            Arc::new(FileBackedDevice::create(dir.path().join("img"), 8192).unwrap());
        std::mem::forget(dir);
        let bc = BufferCache::new(dev, 64);

        let inodes_per_bg = 32u32;
        let blocks_per_bg = 64u32;
        let descriptors = (0..2u32)
            .map(|id| {
                BgDescriptor::new(
                    id,
                    id as u64 * 1024,
                    id as u64 * 1024 + 1,
                    id as u64 * 1024 + 2,
                    id as u64 * 1024 + 3,
                    id as u64 * 1024 + 10,
                    inodes_per_bg,
                    blocks_per_bg,
                )
            })
            .collect();
        (Arc::new(BgTable::new(descriptors, inodes_per_bg, blocks_per_bg)), bc)
    }

    #[test]
    fn inode_zero_is_never_handed_out() {
        let (bg_table, bc) = setup();
        let alloc = BitmapAllocator::new(bg_table, bc);
        let first = alloc.alloc_inode(0).unwrap();
        assert_eq!(first, 1);
    }

    #[test]
    fn freed_inode_is_reused() {
        let (bg_table, bc) = setup();
        let alloc = BitmapAllocator::new(bg_table, bc);
        let a = alloc.alloc_inode(0).unwrap();
        let b = alloc.alloc_inode(0).unwrap();
        assert_ne!(a, b);
        alloc.free_inode(a).unwrap();
        let c = alloc.alloc_inode(0).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn alloc_blocks_spills_into_the_next_group_once_exhausted() {
        let (bg_table, bc) = setup();
        let alloc = BitmapAllocator::new(bg_table, bc);
        let first = alloc.alloc_blocks(0, 64).unwrap();
        assert_eq!(first.len(), 64);
        let second = alloc.alloc_blocks(0, 1).unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0] >= 64);
    }

    #[test]
    fn free_then_realloc_returns_the_same_block() {
        let (bg_table, bc) = setup();
        let alloc = BitmapAllocator::new(bg_table, bc);
        let blocks = alloc.alloc_blocks(0, 4).unwrap();
        alloc.free_blocks(&blocks[1..2]).unwrap();
        let reused = alloc.alloc_blocks(0, 1).unwrap();
        assert_eq!(reused[0], blocks[1]);
    }
}
