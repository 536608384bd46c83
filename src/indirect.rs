//! Indirect-block mapping: direct + 1/2/3-level indirect pointers stored
//! inline in the inode, giving logical→physical block translation
//! (`spec.md` §4.4).
//!
//! Pointer blocks live in the same data-bitmap address space as file
//! content — they are just blocks whose bytes happen to be parsed as an
//! array of `u32` block numbers instead of file data — so both allocation
//! and the buffer-cache key for a pointer block reuse the block number
//! (`bno`, as returned by [`BitmapAllocator::alloc_blocks`]) rather than a
//! logical file offset.

use std::sync::Arc;

use crate::bitmap::BitmapAllocator;
use crate::buffer::BufferCache;
use crate::error::{NvfuseError, Result};
use crate::layout::{IBlocks, Inode};
use crate::param::{NUM_DIRECT_BLOCKS, PTRS_PER_BLOCK};

const L1: u64 = PTRS_PER_BLOCK as u64;
const L2: u64 = L1 * PTRS_PER_BLOCK as u64;
const L3: u64 = L2 * PTRS_PER_BLOCK as u64;

/// Where a logical block number lives in the pointer tree (`spec.md` §4.4
/// `block_to_path`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    /// `level` indirect pointers deep; `offsets[0..level]` are the indices
    /// to follow at each hop, the last one indexing the leaf data pointer.
    Indirect { level: usize, offsets: [u32; 3] },
}

/// Map a logical block number to its position in the direct/indirect tree.
pub fn block_to_path(lbn: u64) -> Option<BlockPath> {
    if lbn < NUM_DIRECT_BLOCKS as u64 {
        return Some(BlockPath::Direct(lbn as usize));
    }
    let lbn = lbn - NUM_DIRECT_BLOCKS as u64;
    if lbn < L1 {
        return Some(BlockPath::Indirect {
            level: 1,
            offsets: [lbn as u32, 0, 0],
        });
    }
    let lbn = lbn - L1;
    if lbn < L2 {
        return Some(BlockPath::Indirect {
            level: 2,
            offsets: [(lbn / L1) as u32, (lbn % L1) as u32, 0],
        });
    }
    let lbn = lbn - L2;
    if lbn < L3 {
        return Some(BlockPath::Indirect {
            level: 3,
            offsets: [(lbn / L2) as u32, ((lbn / L1) % L1) as u32, (lbn % L1) as u32],
        });
    }
    None
}

/// Total logical blocks covered by a subtree rooted at a node `depth`
/// indirections above the leaves (`depth == 0` is a leaf itself).
fn subtree_span(depth: usize) -> u64 {
    match depth {
        0 => 1,
        d => (PTRS_PER_BLOCK as u64).pow(d as u32),
    }
}

fn read_ptr(data: &[u8], idx: usize) -> u32 {
    u32::from_le_bytes(data[idx * 4..idx * 4 + 4].try_into().unwrap())
}

fn write_ptr(data: &mut [u8], idx: usize, val: u32) {
    data[idx * 4..idx * 4 + 4].copy_from_slice(&val.to_le_bytes());
}

/// Resolves `(inode, lbn) -> physical cluster`, allocating pointer and data
/// blocks on demand when `create` is set, and frees subtrees on truncate.
pub struct IndirectMap {
    bc: Arc<BufferCache>,
}

impl IndirectMap {
    pub fn new(bc: Arc<BufferCache>) -> Self {
        Self { bc }
    }

    /// Lets callers that already hold an `Arc<IndirectMap>` reach the
    /// shared buffer cache without threading a second handle through every
    /// constructor (symlink target storage, `fsync`).
    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.bc
    }

    fn root_field(blocks: &mut IBlocks, level: usize) -> &mut u32 {
        match level {
            1 => &mut blocks.single_indirect,
            2 => &mut blocks.double_indirect,
            3 => &mut blocks.triple_indirect,
            _ => unreachable!("indirect level must be 1..=3"),
        }
    }

    /// `get_block(ictx, lbn, create)` (`spec.md` §4.4). Returns `Ok(None)`
    /// for a hole when `create` is false; allocates on demand otherwise.
    pub fn get_block(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        hint_bg: u32,
        lbn: u64,
        create: bool,
    ) -> Result<Option<u64>> {
        let path = block_to_path(lbn).ok_or(NvfuseError::InvalidArgument)?;
        match path {
            BlockPath::Direct(idx) => {
                let mut bno = inode.blocks.direct[idx];
                if bno == 0 {
                    if !create {
                        return Ok(None);
                    }
                    bno = bitmap
                        .alloc_blocks(hint_bg, 1)?
                        .pop()
                        .ok_or(NvfuseError::NoSpace)? as u32;
                    inode.blocks.direct[idx] = bno;
                }
                Ok(Some(bitmap.bno_to_pno(bno as u64).ok_or(NvfuseError::Io)?))
            }
            BlockPath::Indirect { level, offsets } => {
                let mut cur_bno = *Self::root_field(&mut inode.blocks, level);
                if cur_bno == 0 {
                    if !create {
                        return Ok(None);
                    }
                    cur_bno = self.alloc_pointer_block(ino, bitmap, hint_bg)?;
                    *Self::root_field(&mut inode.blocks, level) = cur_bno;
                }
                for depth in 0..level {
                    let pno = bitmap.bno_to_pno(cur_bno as u64).ok_or(NvfuseError::Io)?;
                    let bh = self.bc.get_bh(ino, cur_bno, pno, true, true)?;
                    let idx = offsets[depth] as usize;
                    let next = bh.read(|d| read_ptr(d, idx));
                    let is_last = depth + 1 == level;

                    if next != 0 {
                        cur_bno = next;
                        continue;
                    }
                    if !create {
                        return Ok(None);
                    }
                    let allocated = if is_last {
                        bitmap.alloc_blocks(hint_bg, 1)?.pop().ok_or(NvfuseError::NoSpace)? as u32
                    } else {
                        self.alloc_pointer_block(ino, bitmap, hint_bg)?
                    };
                    bh.write(|d| write_ptr(d, idx, allocated));
                    cur_bno = allocated;
                }
                Ok(Some(bitmap.bno_to_pno(cur_bno as u64).ok_or(NvfuseError::Io)?))
            }
        }
    }

    fn alloc_pointer_block(&self, ino: u32, bitmap: &BitmapAllocator, hint_bg: u32) -> Result<u32> {
        let bno = bitmap.alloc_blocks(hint_bg, 1)?.pop().ok_or(NvfuseError::NoSpace)? as u32;
        let pno = bitmap.bno_to_pno(bno as u64).ok_or(NvfuseError::Io)?;
        self.bc.get_new_bh(ino, bno, pno, true)?; // zeroed, released dirty
        Ok(bno)
    }

    /// Free every block at or past logical block `keep_blocks`
    /// (`spec.md` §4.4 `find_shared` + `free_branches`, folded into one
    /// post-order descent: a subtree reports back whether it ended up
    /// entirely empty so its parent pointer can be cleared too).
    pub fn truncate(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, keep_blocks: u64) -> Result<()> {
        for idx in 0..NUM_DIRECT_BLOCKS {
            let bno = inode.blocks.direct[idx];
            if self.free_subtree(ino, bitmap, bno, 0, idx as u64, keep_blocks)? {
                inode.blocks.direct[idx] = 0;
            }
        }
        let starts = [
            (1usize, NUM_DIRECT_BLOCKS as u64),
            (2, NUM_DIRECT_BLOCKS as u64 + L1),
            (3, NUM_DIRECT_BLOCKS as u64 + L1 + L2),
        ];
        for (level, start) in starts {
            let bno = *Self::root_field(&mut inode.blocks, level);
            if self.free_subtree(ino, bitmap, bno, level, start, keep_blocks)? {
                *Self::root_field(&mut inode.blocks, level) = 0;
            }
        }
        Ok(())
    }

    /// Returns `true` if, after freeing everything at or past
    /// `keep_blocks`, no live block remains under `bno` (so the caller
    /// should clear its own pointer to it too).
    fn free_subtree(
        &self,
        ino: u32,
        bitmap: &BitmapAllocator,
        bno: u32,
        depth: usize,
        start_lbn: u64,
        keep_blocks: u64,
    ) -> Result<bool> {
        if bno == 0 {
            return Ok(true);
        }
        if depth == 0 {
            if start_lbn >= keep_blocks {
                bitmap.free_blocks(&[bno as u64])?;
                return Ok(true);
            }
            return Ok(false);
        }

        let child_span = subtree_span(depth - 1);
        let pno = bitmap.bno_to_pno(bno as u64).ok_or(NvfuseError::Io)?;
        let bh = self.bc.get_bh(ino, bno, pno, true, true)?;
        let mut all_freed = true;
        for i in 0..PTRS_PER_BLOCK {
            let child_bno = bh.read(|d| read_ptr(d, i));
            if child_bno == 0 {
                continue;
            }
            let child_start = start_lbn + i as u64 * child_span;
            if self.free_subtree(ino, bitmap, child_bno, depth - 1, child_start, keep_blocks)? {
                bh.write(|d| write_ptr(d, i, 0));
            } else {
                all_freed = false;
            }
        }
        if all_freed {
            bitmap.free_blocks(&[bno as u64])?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgtable::BgTable;
    use crate::device::{BlockDevice, FileBackedDevice};
    use crate::layout::BgDescriptor;

    fn setup() -> (Arc<BufferCache>, BitmapAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let dev: Arc<dyn BlockDevice> = Arc::new(FileBackedDevice::create(dir.path().join("img"), 1 << 16).unwrap());
        std::mem::forget(dir);
        let bc = BufferCache::new(dev, 256);
        let blocks_per_bg = 8192u32;
        let descriptors = vec![BgDescriptor::new(0, 0, 1, 2, 3, 16, 32, blocks_per_bg)];
        let bg_table = Arc::new(BgTable::new(descriptors, 32, blocks_per_bg));
        (bc.clone(), BitmapAllocator::new(bg_table, bc))
    }

    #[test]
    fn block_to_path_covers_direct_and_every_indirect_level() {
        assert_eq!(block_to_path(0), Some(BlockPath::Direct(0)));
        assert_eq!(block_to_path(7), Some(BlockPath::Direct(7)));
        assert_eq!(
            block_to_path(8),
            Some(BlockPath::Indirect { level: 1, offsets: [0, 0, 0] })
        );
        let double_start = NUM_DIRECT_BLOCKS as u64 + L1;
        assert_eq!(
            block_to_path(double_start),
            Some(BlockPath::Indirect { level: 2, offsets: [0, 0, 0] })
        );
        let triple_start = double_start + L2;
        assert_eq!(
            block_to_path(triple_start),
            Some(BlockPath::Indirect { level: 3, offsets: [0, 0, 0] })
        );
    }

    #[test]
    fn get_block_round_trips_direct_and_indirect_lbns() {
        let (_bc, bitmap) = setup();
        let map = IndirectMap::new(Arc::clone(&_bc));
        let mut inode = Inode::default();

        for &lbn in &[0u64, 7, 8, 9, NUM_DIRECT_BLOCKS as u64 + L1] {
            let pno = map.get_block(1, &mut inode, &bitmap, 0, lbn, true).unwrap().unwrap();
            let reread = map.get_block(1, &mut inode, &bitmap, 0, lbn, false).unwrap().unwrap();
            assert_eq!(pno, reread);
        }
    }

    #[test]
    fn truncate_to_zero_clears_every_pointer() {
        let (_bc, bitmap) = setup();
        let map = IndirectMap::new(Arc::clone(&_bc));
        let mut inode = Inode::default();
        for lbn in 0..12u64 {
            map.get_block(1, &mut inode, &bitmap, 0, lbn, true).unwrap();
        }
        map.truncate(1, &mut inode, &bitmap, 0).unwrap();
        assert_eq!(inode.blocks.direct, [0; NUM_DIRECT_BLOCKS]);
        assert_eq!(inode.blocks.single_indirect, 0);
        for lbn in 0..12u64 {
            assert_eq!(map.get_block(1, &mut inode, &bitmap, 0, lbn, false).unwrap(), None);
        }
    }
}
