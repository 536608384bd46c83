//! Per-directory B+-tree name index (`spec.md` §3 "B+-tree", §4.5 algorithm).
//!
//! The tree lives in the data blocks of a dedicated `BpTree`-type inode
//! (`spec.md` Glossary: "bpino"), one node per cluster. Both node types
//! (`INDEX`/`DATA`) store the same shape — `i_num` keys and `i_num` values
//! — under one convention: a key is always the minimum key reachable
//! through its paired value (a child node number for `INDEX`, an encoded
//! dentry slot for `DATA`). That symmetry is what lets insertion, split,
//! borrow, and merge share the same array-splice helpers regardless of
//! node type; the spec leaves the exact key/child counting convention
//! unspecified, and this is the one resolved here.
//!
//! The tree's own inode reuses the generic [`Inode`] record the same way a
//! regular file does: `size` tracks how many node-clusters have been
//! allocated (a monotonic bump allocator — merged-away nodes are never
//! reclaimed, consistent with the spec's "no online defragmentation"
//! non-goal), and node clusters are addressed through the same
//! [`IndirectMap`] regular files use for their content.

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::bitmap::BitmapAllocator;
use crate::buffer::BufferCache;
use crate::error::{NvfuseError, Result};
use crate::indirect::IndirectMap;
use crate::layout::bpnode::{NodeFlag, BPTREE_FANOUT, NO_NODE};
use crate::layout::{decode_slot, encode_slot, BpNode, Inode};
use crate::param::CLUSTER_SIZE;

/// The tree's root always lives at logical block 0 of the bpino's data, so
/// a root split or shrink never has to change which block callers look at
/// first — only what's written there.
pub const ROOT_LBN: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already had an entry; its collision count was bumped in
    /// place and the original slot kept (`spec.md` §4.5 "Collision
    /// handling"). The caller falls back to a linear scan to disambiguate.
    Collided { dentry_index: u32, collision_count: u32 },
}

pub struct BpTree {
    bc: Arc<BufferCache>,
    indirect: Arc<IndirectMap>,
}

impl BpTree {
    pub fn new(bc: Arc<BufferCache>, indirect: Arc<IndirectMap>) -> Self {
        Self { bc, indirect }
    }

    fn node_pno(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, lbn: u32) -> Result<u64> {
        self.indirect
            .get_block(ino, inode, bitmap, 0, lbn as u64, false)?
            .ok_or(NvfuseError::Io)
    }

    fn read_node(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, lbn: u32) -> Result<BpNode> {
        let pno = self.node_pno(ino, inode, bitmap, lbn)?;
        let bh = self.bc.get_bh(ino, lbn, pno, false, true)?;
        Ok(bh.read(|d| BpNode::read_from(&d[..]).expect("cluster-sized buffer matches BpNode layout")))
    }

    fn write_node(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, lbn: u32, node: &BpNode) -> Result<()> {
        let pno = self.node_pno(ino, inode, bitmap, lbn)?;
        let bh = self.bc.get_bh(ino, lbn, pno, false, false)?;
        bh.write(|d| d.copy_from_slice(node.as_bytes()));
        Ok(())
    }

    fn alloc_node(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        hint_bg: u32,
        content: &BpNode,
    ) -> Result<u32> {
        let lbn = (inode.size / CLUSTER_SIZE as u64) as u32;
        let pno = self
            .indirect
            .get_block(ino, inode, bitmap, hint_bg, lbn as u64, true)?
            .ok_or(NvfuseError::Io)?;
        inode.size += CLUSTER_SIZE as u64;
        let bh = self.bc.get_new_bh(ino, lbn, pno, false)?;
        bh.write(|d| d.copy_from_slice(content.as_bytes()));
        Ok(lbn)
    }

    fn create_root(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, hint_bg: u32) -> Result<()> {
        debug_assert_eq!(inode.size, 0);
        let mut root = BpNode::default();
        root.i_root = 1;
        root.i_offset = ROOT_LBN;
        let lbn = self.alloc_node(ino, inode, bitmap, hint_bg, &root)?;
        debug_assert_eq!(lbn, ROOT_LBN);
        Ok(())
    }

    /// Index-node child to descend into for `key`: the rightmost routing
    /// key not greater than `key` (clamped to child 0 so a key smaller
    /// than everything stored still lands somewhere descendable).
    fn routing_index(node: &BpNode, key: u64) -> usize {
        match node.search(key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    fn descend_to_leaf(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        key: u64,
    ) -> Result<(u32, Vec<(u32, usize)>)> {
        let mut cur = ROOT_LBN;
        let mut stack = Vec::new();
        loop {
            let node = self.read_node(ino, inode, bitmap, cur)?;
            if node.is_leaf() {
                return Ok((cur, stack));
            }
            let idx = Self::routing_index(&node, key);
            stack.push((cur, idx));
            cur = node.values[idx];
        }
    }

    pub fn insert(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        hint_bg: u32,
        key: u64,
        dentry_index: u32,
    ) -> Result<InsertOutcome> {
        if inode.size == 0 {
            self.create_root(ino, inode, bitmap, hint_bg)?;
        }
        let (leaf_lbn, mut stack) = self.descend_to_leaf(ino, inode, bitmap, key)?;
        let mut leaf = self.read_node(ino, inode, bitmap, leaf_lbn)?;
        if let Ok(pos) = leaf.search(key) {
            let (collisions, idx) = decode_slot(leaf.values[pos]);
            leaf.values[pos] = encode_slot(collisions + 1, idx);
            self.write_node(ino, inode, bitmap, leaf_lbn, &leaf)?;
            return Ok(InsertOutcome::Collided {
                dentry_index: idx,
                collision_count: collisions + 1,
            });
        }
        let value = encode_slot(0, dentry_index);
        self.insert_into_node(ino, inode, bitmap, hint_bg, leaf_lbn, &mut stack, true, key, value)?;
        Ok(InsertOutcome::Inserted)
    }

    pub fn lookup(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, key: u64) -> Result<Option<(u32, u32)>> {
        if inode.size == 0 {
            return Ok(None);
        }
        let (leaf_lbn, _stack) = self.descend_to_leaf(ino, inode, bitmap, key)?;
        let leaf = self.read_node(ino, inode, bitmap, leaf_lbn)?;
        Ok(leaf.search(key).ok().map(|pos| decode_slot(leaf.values[pos])))
    }

    pub fn remove(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, hint_bg: u32, key: u64) -> Result<Option<(u32, u32)>> {
        if inode.size == 0 {
            return Ok(None);
        }
        let (leaf_lbn, mut stack) = self.descend_to_leaf(ino, inode, bitmap, key)?;
        let mut leaf = self.read_node(ino, inode, bitmap, leaf_lbn)?;
        let pos = match leaf.search(key) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let removed = decode_slot(leaf.values[pos]);
        let n = leaf.i_num as usize;
        Self::array_remove(&mut leaf.keys, &mut leaf.values, n, pos);
        leaf.i_num -= 1;
        let underflowed = stack.is_empty() == false && (leaf.i_num as usize) < leaf.min_occupancy();
        self.write_node(ino, inode, bitmap, leaf_lbn, &leaf)?;
        if underflowed {
            self.fix_underflow(ino, inode, bitmap, hint_bg, leaf_lbn, true, &mut stack)?;
        }
        Ok(Some(removed))
    }

    /// Rewrite `key`'s stored dentry index without touching its collision
    /// count (directory-entry compaction moves a dentry without changing
    /// the identity of the name it belongs to — `spec.md` §4.5 "Remove
    /// entry"). Returns `false` if `key` isn't present.
    pub fn update(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator, key: u64, new_dentry_index: u32) -> Result<bool> {
        if inode.size == 0 {
            return Ok(false);
        }
        let (leaf_lbn, _stack) = self.descend_to_leaf(ino, inode, bitmap, key)?;
        let mut leaf = self.read_node(ino, inode, bitmap, leaf_lbn)?;
        match leaf.search(key) {
            Ok(pos) => {
                let (collisions, _) = decode_slot(leaf.values[pos]);
                leaf.values[pos] = encode_slot(collisions, new_dentry_index);
                self.write_node(ino, inode, bitmap, leaf_lbn, &leaf)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn array_insert(keys: &mut [u64; BPTREE_FANOUT], values: &mut [u32; BPTREE_FANOUT], len: usize, pos: usize, key: u64, value: u32) {
        for i in (pos..len).rev() {
            keys[i + 1] = keys[i];
            values[i + 1] = values[i];
        }
        keys[pos] = key;
        values[pos] = value;
    }

    fn array_remove(keys: &mut [u64; BPTREE_FANOUT], values: &mut [u32; BPTREE_FANOUT], len: usize, pos: usize) {
        for i in pos..len - 1 {
            keys[i] = keys[i + 1];
            values[i] = values[i + 1];
        }
    }

    fn build_node(is_leaf: bool, keys: &[u64], values: &[u32]) -> BpNode {
        let mut n = BpNode::default();
        n.i_flag = if is_leaf { NodeFlag::Data } else { NodeFlag::Index } as u32;
        n.i_num = keys.len() as u32;
        n.keys[..keys.len()].copy_from_slice(keys);
        n.values[..values.len()].copy_from_slice(values);
        n
    }

    /// Insert `(key, value)` into the node at `node_lbn`, splitting (and
    /// propagating the split up `stack`, growing a new root if needed) as
    /// many levels as necessary (`spec.md` §4.5 "Insertion").
    #[allow(clippy::too_many_arguments)]
    fn insert_into_node(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        hint_bg: u32,
        node_lbn: u32,
        stack: &mut Vec<(u32, usize)>,
        is_leaf: bool,
        key: u64,
        value: u32,
    ) -> Result<()> {
        let node = self.read_node(ino, inode, bitmap, node_lbn)?;
        let n = node.i_num as usize;
        let pos = match node.keys[..n].binary_search(&key) {
            Ok(p) | Err(p) => p,
        };

        if n < BPTREE_FANOUT {
            let mut node = node;
            Self::array_insert(&mut node.keys, &mut node.values, n, pos, key, value);
            node.i_num += 1;
            return self.write_node(ino, inode, bitmap, node_lbn, &node);
        }

        let mut combined_keys = Vec::with_capacity(n + 1);
        let mut combined_values = Vec::with_capacity(n + 1);
        combined_keys.extend_from_slice(&node.keys[..pos]);
        combined_values.extend_from_slice(&node.values[..pos]);
        combined_keys.push(key);
        combined_values.push(value);
        combined_keys.extend_from_slice(&node.keys[pos..n]);
        combined_values.extend_from_slice(&node.values[pos..n]);

        let split_at = combined_keys.len() / 2;
        let (left_k, right_k) = combined_keys.split_at(split_at);
        let (left_v, right_v) = combined_values.split_at(split_at);

        if stack.is_empty() {
            debug_assert_eq!(node_lbn, ROOT_LBN);
            let left_content = Self::build_node(is_leaf, left_k, left_v);
            let right_content = Self::build_node(is_leaf, right_k, right_v);
            let left_lbn = self.alloc_node(ino, inode, bitmap, hint_bg, &left_content)?;
            let right_lbn = self.alloc_node(ino, inode, bitmap, hint_bg, &right_content)?;
            if is_leaf {
                let mut left = left_content;
                left.i_next_node = right_lbn;
                left.i_offset = left_lbn;
                self.write_node(ino, inode, bitmap, left_lbn, &left)?;
                let mut right = right_content;
                right.i_prev_node = left_lbn;
                right.i_offset = right_lbn;
                self.write_node(ino, inode, bitmap, right_lbn, &right)?;
            }
            let mut root = Self::build_node(false, &[left_k[0], right_k[0]], &[left_lbn, right_lbn]);
            root.i_root = 1;
            root.i_offset = ROOT_LBN;
            return self.write_node(ino, inode, bitmap, ROOT_LBN, &root);
        }

        let right_content = Self::build_node(is_leaf, right_k, right_v);
        let right_lbn = self.alloc_node(ino, inode, bitmap, hint_bg, &right_content)?;
        let mut left = Self::build_node(is_leaf, left_k, left_v);
        left.i_offset = node_lbn;
        if is_leaf {
            let old_next = node.i_next_node;
            left.i_next_node = right_lbn;
            left.i_prev_node = node.i_prev_node;
            let mut right = right_content;
            right.i_next_node = old_next;
            right.i_prev_node = node_lbn;
            right.i_offset = right_lbn;
            self.write_node(ino, inode, bitmap, right_lbn, &right)?;
            if old_next != NO_NODE {
                let mut far = self.read_node(ino, inode, bitmap, old_next)?;
                far.i_prev_node = right_lbn;
                self.write_node(ino, inode, bitmap, old_next, &far)?;
            }
        } else {
            self.write_node(ino, inode, bitmap, right_lbn, &right_content)?;
        }
        self.write_node(ino, inode, bitmap, node_lbn, &left)?;

        let (parent_lbn, _child_idx) = stack.pop().unwrap();
        self.insert_into_node(ino, inode, bitmap, hint_bg, parent_lbn, stack, false, right_k[0], right_lbn)
    }

    /// Restore minimum occupancy at `node_lbn` (a leaf iff `is_leaf`) by
    /// borrowing from a same-parent sibling or merging with one,
    /// propagating the shrink upward as needed and finally collapsing the
    /// root if it is left with a single child (`spec.md` §4.5 "Deletion").
    fn fix_underflow(
        &self,
        ino: u32,
        inode: &mut Inode,
        bitmap: &BitmapAllocator,
        _hint_bg: u32,
        mut node_lbn: u32,
        mut is_leaf: bool,
        stack: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        loop {
            let (parent_lbn, child_idx) = match stack.pop() {
                Some(v) => v,
                None => return Ok(()),
            };
            let mut parent = self.read_node(ino, inode, bitmap, parent_lbn)?;
            let mut node = self.read_node(ino, inode, bitmap, node_lbn)?;
            let right_idx = child_idx + 1;
            let have_right = right_idx < parent.i_num as usize;
            let have_left = child_idx > 0;

            if have_right {
                let right_lbn = parent.values[right_idx];
                let mut right = self.read_node(ino, inode, bitmap, right_lbn)?;
                if (right.i_num as usize) > right.min_occupancy() {
                    let bk = right.keys[0];
                    let bv = right.values[0];
                    Self::array_remove(&mut right.keys, &mut right.values, right.i_num as usize, 0);
                    right.i_num -= 1;
                    let n = node.i_num as usize;
                    node.keys[n] = bk;
                    node.values[n] = bv;
                    node.i_num += 1;
                    parent.keys[right_idx] = right.keys[0];
                    self.write_node(ino, inode, bitmap, node_lbn, &node)?;
                    self.write_node(ino, inode, bitmap, right_lbn, &right)?;
                    self.write_node(ino, inode, bitmap, parent_lbn, &parent)?;
                    return Ok(());
                }
            }
            if have_left {
                let left_idx = child_idx - 1;
                let left_lbn = parent.values[left_idx];
                let mut left = self.read_node(ino, inode, bitmap, left_lbn)?;
                if (left.i_num as usize) > left.min_occupancy() {
                    let last = left.i_num as usize - 1;
                    let bk = left.keys[last];
                    let bv = left.values[last];
                    left.i_num -= 1;
                    let n = node.i_num as usize;
                    Self::array_insert(&mut node.keys, &mut node.values, n, 0, bk, bv);
                    node.i_num += 1;
                    parent.keys[child_idx] = node.keys[0];
                    self.write_node(ino, inode, bitmap, node_lbn, &node)?;
                    self.write_node(ino, inode, bitmap, left_lbn, &left)?;
                    self.write_node(ino, inode, bitmap, parent_lbn, &parent)?;
                    return Ok(());
                }
            }

            // Neither sibling can lend a key without itself underflowing:
            // merge with whichever sibling exists.
            if have_right {
                let right_lbn = parent.values[right_idx];
                let right = self.read_node(ino, inode, bitmap, right_lbn)?;
                let base = node.i_num as usize;
                let rn = right.i_num as usize;
                node.keys[base..base + rn].copy_from_slice(&right.keys[..rn]);
                node.values[base..base + rn].copy_from_slice(&right.values[..rn]);
                node.i_num += right.i_num;
                if is_leaf {
                    node.i_next_node = right.i_next_node;
                    if right.i_next_node != NO_NODE {
                        let mut far = self.read_node(ino, inode, bitmap, right.i_next_node)?;
                        far.i_prev_node = node_lbn;
                        self.write_node(ino, inode, bitmap, right.i_next_node, &far)?;
                    }
                }
                Self::array_remove(&mut parent.keys, &mut parent.values, parent.i_num as usize, right_idx);
                parent.i_num -= 1;
                self.write_node(ino, inode, bitmap, node_lbn, &node)?;
                self.write_node(ino, inode, bitmap, parent_lbn, &parent)?;
                // right_lbn is now unreachable; its cluster is not reclaimed.
            } else if have_left {
                let left_idx = child_idx - 1;
                let left_lbn = parent.values[left_idx];
                let mut left = self.read_node(ino, inode, bitmap, left_lbn)?;
                let base = left.i_num as usize;
                let nn = node.i_num as usize;
                left.keys[base..base + nn].copy_from_slice(&node.keys[..nn]);
                left.values[base..base + nn].copy_from_slice(&node.values[..nn]);
                left.i_num += node.i_num;
                if is_leaf {
                    left.i_next_node = node.i_next_node;
                    if node.i_next_node != NO_NODE {
                        let mut far = self.read_node(ino, inode, bitmap, node.i_next_node)?;
                        far.i_prev_node = left_lbn;
                        self.write_node(ino, inode, bitmap, node.i_next_node, &far)?;
                    }
                }
                Self::array_remove(&mut parent.keys, &mut parent.values, parent.i_num as usize, child_idx);
                parent.i_num -= 1;
                self.write_node(ino, inode, bitmap, left_lbn, &left)?;
                self.write_node(ino, inode, bitmap, parent_lbn, &parent)?;
            } else {
                unreachable!("a non-root node always has at least one sibling");
            }

            if stack.is_empty() {
                return self.maybe_shrink_root(ino, inode, bitmap);
            }
            if (parent.i_num as usize) >= parent.min_occupancy() {
                return Ok(());
            }
            node_lbn = parent_lbn;
            is_leaf = false;
        }
    }

    fn maybe_shrink_root(&self, ino: u32, inode: &mut Inode, bitmap: &BitmapAllocator) -> Result<()> {
        loop {
            let root = self.read_node(ino, inode, bitmap, ROOT_LBN)?;
            if root.is_leaf() || root.i_num != 1 {
                return Ok(());
            }
            let child_lbn = root.values[0];
            let mut collapsed = self.read_node(ino, inode, bitmap, child_lbn)?;
            collapsed.i_root = 1;
            collapsed.i_offset = ROOT_LBN;
            self.write_node(ino, inode, bitmap, ROOT_LBN, &collapsed)?;
            // child_lbn's cluster is now unreachable and not reclaimed.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgtable::BgTable;
    use crate::device::{BlockDevice, FileBackedDevice};
    use crate::layout::BgDescriptor;

    fn setup() -> (u32, Inode, BitmapAllocator, BpTree) {
        let dir = tempfile::tempdir().unwrap();
        let dev: Arc<dyn BlockDevice> = Arc::new(FileBackedDevice::create(dir.path().join("img"), 1 << 17).unwrap());
        std::mem::forget(dir);
        let bc = BufferCache::new(dev, 512);
        let blocks_per_bg = 65536u32;
        let descriptors = vec![BgDescriptor::new(0, 0, 1, 2, 3, 16, 32, blocks_per_bg)];
        let bg_table = Arc::new(BgTable::new(descriptors, 32, blocks_per_bg));
        let bitmap = BitmapAllocator::new(Arc::clone(&bg_table), Arc::clone(&bc));
        let indirect = Arc::new(IndirectMap::new(Arc::clone(&bc)));
        let tree = BpTree::new(bc, indirect);
        (2, Inode::default(), bitmap, tree)
    }

    fn hash(name: &str) -> u64 {
        let h = crc32c::crc32c(name.as_bytes()) as u64;
        (h << 32) | (h ^ 0xffff_ffff)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let (ino, mut inode, bitmap, tree) = setup();
        let key = hash("hello.txt");
        let outcome = tree.insert(ino, &mut inode, &bitmap, 0, key, 7).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        let found = tree.lookup(ino, &mut inode, &bitmap, key).unwrap();
        assert_eq!(found, Some((0, 7)));
    }

    #[test]
    fn reinserting_the_same_key_bumps_the_collision_count_and_keeps_the_slot() {
        let (ino, mut inode, bitmap, tree) = setup();
        let key = hash("dup");
        tree.insert(ino, &mut inode, &bitmap, 0, key, 1).unwrap();
        let outcome = tree.insert(ino, &mut inode, &bitmap, 0, key, 2).unwrap();
        assert_eq!(
            outcome,
            InsertOutcome::Collided { dentry_index: 1, collision_count: 1 }
        );
        assert_eq!(tree.lookup(ino, &mut inode, &bitmap, key).unwrap(), Some((1, 1)));
    }

    #[test]
    fn many_inserts_force_splits_and_stay_fully_lookupable() {
        let (ino, mut inode, bitmap, tree) = setup();
        let count = (BPTREE_FANOUT * 4) as u32;
        for i in 0..count {
            let key = (i as u64) << 20 | i as u64; // monotonically increasing, collision-free
            tree.insert(ino, &mut inode, &bitmap, 0, key, i).unwrap();
        }
        for i in 0..count {
            let key = (i as u64) << 20 | i as u64;
            assert_eq!(tree.lookup(ino, &mut inode, &bitmap, key).unwrap(), Some((0, i)));
        }
    }

    #[test]
    fn remove_then_lookup_reports_absent() {
        let (ino, mut inode, bitmap, tree) = setup();
        let key = hash("bye.txt");
        tree.insert(ino, &mut inode, &bitmap, 0, key, 3).unwrap();
        let removed = tree.remove(ino, &mut inode, &bitmap, 0, key).unwrap();
        assert_eq!(removed, Some((0, 3)));
        assert_eq!(tree.lookup(ino, &mut inode, &bitmap, key).unwrap(), None);
        assert_eq!(tree.remove(ino, &mut inode, &bitmap, 0, key).unwrap(), None);
    }

    #[test]
    fn inserting_past_several_splits_then_removing_everything_empties_the_tree() {
        let (ino, mut inode, bitmap, tree) = setup();
        let count = (BPTREE_FANOUT * 3) as u32;
        let keys: Vec<u64> = (0..count).map(|i| (i as u64) << 20 | i as u64).collect();
        for (i, &key) in keys.iter().enumerate() {
            tree.insert(ino, &mut inode, &bitmap, 0, key, i as u32).unwrap();
        }
        for &key in &keys {
            assert!(tree.remove(ino, &mut inode, &bitmap, 0, key).unwrap().is_some());
        }
        for &key in &keys {
            assert_eq!(tree.lookup(ino, &mut inode, &bitmap, key).unwrap(), None);
        }
    }
}
