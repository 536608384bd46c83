//! On-disk B+-tree node layout (`spec.md` §3 "B+-tree", §4.5 algorithm).
//!
//! Each node occupies exactly one cluster: a fixed header followed by
//! `BPTREE_FANOUT` keys and `BPTREE_FANOUT` values, with the fanout forced
//! odd so a split always has a well-defined median.

use zerocopy::{AsBytes, FromBytes};

use crate::param::CLUSTER_SIZE;

// 8 `u32`s, not 7: `keys: [u64; _]` right after the header needs 8-byte
// alignment, so the header itself must already be a multiple of 8 bytes or
// the compiler inserts a 4-byte gap before `keys` that `AsBytes` rejects.
const HEADER_SIZE: usize = 8 * core::mem::size_of::<u32>();
const ENTRY_SIZE: usize = core::mem::size_of::<u64>() + core::mem::size_of::<u32>();

const fn compute_fanout() -> usize {
    let raw = (CLUSTER_SIZE - HEADER_SIZE) / ENTRY_SIZE;
    if raw % 2 == 0 {
        raw - 1
    } else {
        raw
    }
}

/// Keys-per-node / values-per-node of every B+-tree node.
pub const BPTREE_FANOUT: usize = compute_fanout();

/// Bytes left over after the header and `BPTREE_FANOUT` keys/values, kept
/// as explicit trailing padding so the node is exactly `CLUSTER_SIZE`.
const TAIL_PAD: usize = CLUSTER_SIZE - HEADER_SIZE - BPTREE_FANOUT * ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeFlag {
    Index = 0,
    Data = 1,
}

impl NodeFlag {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Index,
            1 => Self::Data,
            _ => return None,
        })
    }
}

/// One cluster-sized B+-tree node: an internal ("index") node routes by
/// key, a leaf ("data") node holds the final key→slot mapping and is
/// linked to its siblings for range scans (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct BpNode {
    pub i_root: u32,
    pub i_flag: u32,
    pub i_num: u32,
    /// This node's own block index within the owning B+-tree inode, used
    /// to sanity-check traversal (`spec.md` §4.5).
    pub i_offset: u32,
    pub i_next_node: u32,
    pub i_prev_node: u32,
    pub i_status: u32,
    _pad: u32,
    pub keys: [u64; BPTREE_FANOUT],
    pub values: [u32; BPTREE_FANOUT],
    _tail_pad: [u8; TAIL_PAD],
}

static_assertions::const_assert_eq!(core::mem::size_of::<BpNode>(), CLUSTER_SIZE);

pub const NO_NODE: u32 = u32::MAX;

impl Default for BpNode {
    fn default() -> Self {
        Self {
            i_root: 0,
            i_flag: NodeFlag::Data as u32,
            i_num: 0,
            i_offset: 0,
            i_next_node: NO_NODE,
            i_prev_node: NO_NODE,
            i_status: 0,
            _pad: 0,
            keys: [0; BPTREE_FANOUT],
            values: [0; BPTREE_FANOUT],
            _tail_pad: [0; TAIL_PAD],
        }
    }
}

impl BpNode {
    pub fn flag(&self) -> NodeFlag {
        NodeFlag::from_u32(self.i_flag).unwrap_or(NodeFlag::Data)
    }

    pub fn is_root(&self) -> bool {
        self.i_root != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.flag() == NodeFlag::Data
    }

    pub fn is_full(&self) -> bool {
        self.i_num as usize == BPTREE_FANOUT
    }

    pub fn min_occupancy(&self) -> usize {
        BPTREE_FANOUT / 2 + 1
    }

    /// Binary search among the first `i_num` keys. For an index node this
    /// returns the child slot whose range covers `key` (value at the
    /// returned position or, on exact miss, the position to descend into);
    /// for a leaf it returns `Ok(i)` on an exact match.
    pub fn search(&self, key: u64) -> core::result::Result<usize, usize> {
        self.keys[..self.i_num as usize].binary_search(&key)
    }
}
