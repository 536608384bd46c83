//! On-disk record definitions (`spec.md` §3). Every record here is
//! `#[repr(C)]` plus `zerocopy::{AsBytes, FromBytes}` so a `[u8; 4096]`
//! cluster buffer can be safely reinterpreted as the typed record and
//! back, without `unsafe` transmutes in this layer (`SPEC_FULL.md` §3.1).

pub mod bg;
pub mod bpnode;
pub mod dentry;
pub mod inode;
pub mod superblock;

pub use bg::BgDescriptor;
pub use bpnode::BpNode;
pub use dentry::Dentry;
pub use inode::{IBlocks, Inode, InodeType};
pub use superblock::{AppSuperblock, SbState, Superblock};

use crate::param::{BPTREE_SLOT_INDEX_BITS, BPTREE_SLOT_INDEX_MASK};

/// Pack a dentry index and its collision count into a B+-tree value
/// (`spec.md` Glossary: "Slot").
pub fn encode_slot(collision_count: u32, dentry_index: u32) -> u32 {
    debug_assert!(dentry_index <= BPTREE_SLOT_INDEX_MASK);
    (collision_count << BPTREE_SLOT_INDEX_BITS) | (dentry_index & BPTREE_SLOT_INDEX_MASK)
}

/// Inverse of [`encode_slot`]: `(collision_count, dentry_index)`.
pub fn decode_slot(slot: u32) -> (u32, u32) {
    (slot >> BPTREE_SLOT_INDEX_BITS, slot & BPTREE_SLOT_INDEX_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trips() {
        let slot = encode_slot(3, 12345);
        assert_eq!(decode_slot(slot), (3, 12345));
    }
}
