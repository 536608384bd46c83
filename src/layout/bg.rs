//! Block group descriptor (`spec.md` §3 "BG descriptor", §3 layout table).

use zerocopy::{AsBytes, FromBytes};

use crate::param::NVFUSE_BD_SIGNATURE;

/// One block group's fixed-layout descriptor. Static after `format`
/// except for the mutable counters and the owner/hint fields.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct BgDescriptor {
    pub id: u32,
    pub magic: u32,
    pub bg_start: u64,
    pub ibitmap_start: u64,
    pub dbitmap_start: u64,
    pub itable_start: u64,
    pub dtable_start: u64,
    pub max_inodes: u32,
    pub max_blocks: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
    /// Core id of the process currently leasing this BG, or `u32::MAX` if
    /// unowned (`spec.md` §4.9 reservation table, §5 shared-resource policy).
    pub owner_core_id: u32,
    /// Round-robin allocation hint into the data bitmap (`spec.md` §4.3).
    pub bd_next_block: u32,
}

pub const NO_OWNER: u32 = u32::MAX;

impl BgDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        bg_start: u64,
        ibitmap_start: u64,
        dbitmap_start: u64,
        itable_start: u64,
        dtable_start: u64,
        max_inodes: u32,
        max_blocks: u32,
    ) -> Self {
        Self {
            id,
            magic: NVFUSE_BD_SIGNATURE,
            bg_start,
            ibitmap_start,
            dbitmap_start,
            itable_start,
            dtable_start,
            max_inodes,
            max_blocks,
            free_inodes: max_inodes,
            free_blocks: max_blocks,
            owner_core_id: NO_OWNER,
            bd_next_block: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == NVFUSE_BD_SIGNATURE
    }

    pub fn is_unowned(&self) -> bool {
        self.owner_core_id == NO_OWNER
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_blocks == self.max_blocks && self.free_inodes == self.max_inodes
    }
}

static_assertions::const_assert!(core::mem::size_of::<BgDescriptor>() <= 4096);
