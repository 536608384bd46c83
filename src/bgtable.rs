//! Block-group descriptor table and reserved-inode address translation
//! (`spec.md` §4.1 "Reserved-inode translation", §4.3).
//!
//! Every structure that needs to turn a logical address into a physical
//! cluster number for one of the reserved pseudo-inodes (`BLOCK_IO_INO`,
//! `ITABLE_INO`, `{D,I}BITMAP_INO`, `BD_INO`) — the inode-context cache
//! reading the inode table, the bitmap allocator, `fsck`-style tooling —
//! goes through this table instead of re-deriving the formulas locally.

use parking_lot::RwLock;

use crate::layout::BgDescriptor;
use crate::param::{CLUSTER_SIZE, INODE_ENTRY_SIZE};

pub const ENTRIES_PER_BLOCK: u32 = (CLUSTER_SIZE / INODE_ENTRY_SIZE) as u32;

pub struct BgTableInner {
    pub descriptors: Vec<BgDescriptor>,
    pub inodes_per_bg: u32,
    pub blocks_per_bg: u32,
}

pub struct BgTable {
    pub inner: RwLock<BgTableInner>,
}

impl BgTable {
    pub fn new(descriptors: Vec<BgDescriptor>, inodes_per_bg: u32, blocks_per_bg: u32) -> Self {
        Self {
            inner: RwLock::new(BgTableInner {
                descriptors,
                inodes_per_bg,
                blocks_per_bg,
            }),
        }
    }

    pub fn bg_count(&self) -> u32 {
        self.inner.read().descriptors.len() as u32
    }

    /// `BLOCK_IO_INO`: identity mapping.
    pub fn translate_block_io(&self, lbn: u64) -> u64 {
        lbn
    }

    /// `ITABLE_INO`: `bd[bg].itable_start + lbn % bd.itable_size`, where
    /// `bg = lbn / (inodes_per_bg/entries_per_block)`.
    pub fn translate_itable(&self, lbn: u32) -> Option<u64> {
        let inner = self.inner.read();
        let blocks_per_bg_itable = inner.inodes_per_bg / ENTRIES_PER_BLOCK;
        let bg = lbn / blocks_per_bg_itable;
        let bd = inner.descriptors.get(bg as usize)?;
        Some(bd.itable_start + (lbn % blocks_per_bg_itable) as u64)
    }

    /// Cluster index of the inode table block holding `ino`, and the byte
    /// offset of that inode's record within the cluster.
    pub fn itable_location(&self, ino: u32) -> Option<(u64, usize)> {
        let lbn = ino / ENTRIES_PER_BLOCK;
        let pno = self.translate_itable(lbn)?;
        let offset = (ino % ENTRIES_PER_BLOCK) as usize * INODE_ENTRY_SIZE;
        Some((pno, offset))
    }

    /// `DBITMAP_INO`/`IBITMAP_INO`: `bd[lbn].dbitmap_start`/`.ibitmap_start`,
    /// offset by `cluster_offset` clusters for bitmaps wider than one
    /// cluster.
    pub fn translate_dbitmap(&self, bg_id: u32, cluster_offset: u64) -> Option<u64> {
        self.inner
            .read()
            .descriptors
            .get(bg_id as usize)
            .map(|d| d.dbitmap_start + cluster_offset)
    }

    pub fn translate_ibitmap(&self, bg_id: u32, cluster_offset: u64) -> Option<u64> {
        self.inner
            .read()
            .descriptors
            .get(bg_id as usize)
            .map(|d| d.ibitmap_start + cluster_offset)
    }

    /// `BD_INO`: `lbn * clusters_per_bg + BD_OFFSET` (the descriptor lives
    /// at cluster 0 of its block group).
    pub fn translate_bd(&self, bg_id: u64) -> u64 {
        bg_id * self.inner.read().blocks_per_bg as u64
    }

    pub fn descriptor(&self, bg_id: u32) -> Option<BgDescriptor> {
        self.inner.read().descriptors.get(bg_id as usize).copied()
    }

    pub fn with_descriptor_mut<R>(&self, bg_id: u32, f: impl FnOnce(&mut BgDescriptor) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.descriptors.get_mut(bg_id as usize).map(f)
    }

    pub fn data_pno(&self, bg_id: u32, dtable_offset: u32) -> Option<u64> {
        self.descriptor(bg_id).map(|d| d.dtable_start + dtable_offset as u64)
    }

    pub fn for_each_descriptor<R>(&self, f: impl FnMut(&BgDescriptor) -> R) -> Vec<R> {
        self.inner.read().descriptors.iter().map(f).collect()
    }

    pub fn total_free_blocks(&self) -> u64 {
        self.inner.read().descriptors.iter().map(|d| d.free_blocks as u64).sum()
    }

    pub fn total_free_inodes(&self) -> u64 {
        self.inner.read().descriptors.iter().map(|d| d.free_inodes as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BgDescriptor;

    fn table() -> BgTable {
        let inodes_per_bg = 32;
        let blocks_per_bg = 1024u64;
        let descriptors = (0..3u32)
            .map(|id| {
                BgDescriptor::new(
                    id,
                    id as u64 * blocks_per_bg,
                    id as u64 * blocks_per_bg + 2,
                    id as u64 * blocks_per_bg + 3,
                    id as u64 * blocks_per_bg + 4,
                    id as u64 * blocks_per_bg + 10,
                    inodes_per_bg,
                    blocks_per_bg as u32,
                )
            })
            .collect();
        BgTable::new(descriptors, inodes_per_bg, blocks_per_bg as u32)
    }

    #[test]
    fn itable_location_walks_into_the_right_bg() {
        let t = table();
        // inodes_per_bg=32, entries_per_block=16 => 2 itable blocks per bg.
        let (pno, off) = t.itable_location(0).unwrap();
        assert_eq!(pno, 4);
        assert_eq!(off, 0);
        let (pno, off) = t.itable_location(33).unwrap(); // bg 1, local lbn 0
        assert_eq!(pno, 1024 + 4);
        assert_eq!(off, (33 % 16) * INODE_ENTRY_SIZE);
    }
}
