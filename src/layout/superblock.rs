//! Superblock and app-superblock records (`spec.md` §3 "Superblock",
//! §4.10 lifecycle, §6 state word).

use zerocopy::{AsBytes, FromBytes};

use crate::param::NVFUSE_SB_SIGNATURE;

/// Superblock state word (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SbState {
    Formatted = 1,
    Initialized = 2,
    Mounted = 3,
    Umounted = 4,
    Crashed = 5,
}

impl SbState {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Formatted,
            2 => Self::Initialized,
            3 => Self::Mounted,
            4 => Self::Umounted,
            5 => Self::Crashed,
            _ => return None,
        })
    }
}

/// Per-owner counters used by secondary processes operating on a cached
/// projection of the superblock (`spec.md` §3, §5: "secondaries operate
/// on a cached projection").
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Default)]
#[repr(C)]
pub struct AppSuperblock {
    pub owner_core_id: u32,
    pub root_bg_id: u32,
    pub free_blocks: u64,
    pub free_inodes: u64,
}

/// The on-disk superblock record, persisted at `param::SUPERBLOCK_CLUSTER`
/// in block group 0.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct Superblock {
    pub signature: u32,
    pub state: u32,
    pub total_clusters: u64,
    pub free_inodes: u64,
    pub free_blocks: u64,
    pub bg_num: u32,
    pub inodes_per_bg: u32,
    pub blocks_per_bg: u32,
    pub root_ino: u32,
    pub last_update: u64,
    pub app: AppSuperblock,
}

impl Superblock {
    pub fn new(
        total_clusters: u64,
        bg_num: u32,
        inodes_per_bg: u32,
        blocks_per_bg: u32,
        root_ino: u32,
    ) -> Self {
        Self {
            signature: NVFUSE_SB_SIGNATURE,
            state: SbState::Formatted as u32,
            total_clusters,
            free_inodes: (inodes_per_bg as u64) * (bg_num as u64) - 1,
            free_blocks: (blocks_per_bg as u64) * (bg_num as u64),
            bg_num,
            inodes_per_bg,
            blocks_per_bg,
            root_ino,
            last_update: 0,
            app: AppSuperblock::default(),
        }
    }

    pub fn state(&self) -> Option<SbState> {
        SbState::from_u32(self.state)
    }

    pub fn set_state(&mut self, s: SbState) {
        self.state = s as u32;
    }

    pub fn is_valid(&self) -> bool {
        self.signature == NVFUSE_SB_SIGNATURE
    }
}

static_assertions::const_assert!(core::mem::size_of::<Superblock>() <= 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_superblock_accounts_for_the_root_inode() {
        let sb = Superblock::new(4096, 4, 256, 1024, 1);
        assert_eq!(sb.free_inodes, 4 * 256 - 1);
        assert_eq!(sb.state(), Some(SbState::Formatted));
    }
}
