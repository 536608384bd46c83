//! On-disk inode record and indirect-pointer layout (`spec.md` §3 "Inode",
//! "Indirect map inside inode").

use zerocopy::{AsBytes, FromBytes};

use crate::param::{INODE_ENTRY_SIZE, NUM_DIRECT_BLOCKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InodeType {
    Free = 0,
    File = 1,
    Dir = 2,
    BpTree = 3,
    Symlink = 4,
    Special = 5,
}

impl InodeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Free,
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::BpTree,
            4 => Self::Symlink,
            5 => Self::Special,
            _ => return None,
        })
    }
}

/// Direct blocks plus 1/2/3-level indirect pointers, packed inline in the
/// inode (`spec.md` §3, §4.4).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct IBlocks {
    pub direct: [u32; NUM_DIRECT_BLOCKS],
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl Default for IBlocks {
    fn default() -> Self {
        Self {
            direct: [0; NUM_DIRECT_BLOCKS],
            single_indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
        }
    }
}

/// Fixed-size inode table entry.
///
/// Invariant (`spec.md` §3): the inode stored in slot `k` of the table
/// either has `ino == k` (allocated) or `ino == 0` (free).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct Inode {
    pub ino: u32,
    pub itype: u8,
    pub i_deleted: u8,
    _pad0: u16,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    // Keeps `size` 8-byte aligned with no implicit gap — `mode`/`uid`/`gid`
    // end at offset 20, and `u64` fields need offset % 8 == 0.
    _pad1: u32,
    pub size: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub links_count: u32,
    pub version: u32,
    /// Directory write cursor: index of the last used dentry.
    pub ptr: u32,
    /// Root inode of this directory's B+-tree index, 0 until lazily
    /// allocated (`spec.md` §3 "bpino").
    pub bpino: u32,
    pub blocks: IBlocks,
    _reserved: [u8; 140],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Inode>(), INODE_ENTRY_SIZE);

impl Default for Inode {
    fn default() -> Self {
        Self {
            ino: 0,
            itype: InodeType::Free as u8,
            i_deleted: 0,
            _pad0: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            _pad1: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            links_count: 0,
            version: 0,
            ptr: 0,
            bpino: 0,
            blocks: IBlocks::default(),
            _reserved: [0; 140],
        }
    }
}

impl Inode {
    pub fn is_free(&self) -> bool {
        self.ino == 0
    }

    pub fn itype(&self) -> Option<InodeType> {
        InodeType::from_u8(self.itype)
    }

    pub fn set_itype(&mut self, t: InodeType) {
        self.itype = t as u8;
    }
}
