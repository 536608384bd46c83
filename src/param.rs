//! On-disk layout and engine-tuning constants (`spec.md` §3, §6).

/// Size of one on-disk/in-memory unit of addressing.
pub const CLUSTER_SIZE: usize = 4096;

/// Bits tracked per byte of a bitmap (ext2 bit-numbering, little-endian
/// within the byte — `spec.md` §9 open question).
pub const BITS_PER_BYTE: usize = 8;

/// log2 of the block-group size in clusters: 2^10 clusters * 4096B = 4MiB.
pub const BG_SIZE_BITS: u32 = 10;

/// Number of clusters in one block group (default, overridable by
/// `FormatOptions::bg_size_bits`).
pub const CLUSTERS_PER_BG: u64 = 1 << BG_SIZE_BITS;

/// Cluster index of the superblock inside block group 0.
pub const SUPERBLOCK_CLUSTER: u64 = 0;

/// 4-byte magic stamped into the superblock.
pub const NVFUSE_SB_SIGNATURE: u32 = 0x4e56_4653; // "NVFS"

/// 4-byte magic stamped into each block group descriptor.
pub const NVFUSE_BD_SIGNATURE: u32 = 0x4e56_4244; // "NVBD"

/// Fixed size of one inode table entry.
pub const INODE_ENTRY_SIZE: usize = 256;

/// Inode number of the file system root directory.
pub const ROOT_INO: u32 = 1;

/// Reserved inode numbers used for reserved-inode translation (`spec.md`
/// §4.1 table). These never appear in a block group's inode bitmap.
pub const BLOCK_IO_INO: u32 = 0xffff_fffd;
pub const ITABLE_INO: u32 = 0xffff_fffc;
pub const DBITMAP_INO: u32 = 0xffff_fffb;
pub const IBITMAP_INO: u32 = 0xffff_fffa;
pub const BD_INO: u32 = 0xffff_fff9;

/// Maximum length of a path component.
pub const FNAME_SIZE: usize = 100;

/// Watermark at which the write path asks the buffer cache to start
/// flushing proactively instead of waiting for eviction pressure.
pub const NVFUSE_SYNC_DIRTY_COUNT: usize = 1024;

/// Maximum device jobs drained by one `check_flush_dirty` pass.
pub const AIO_MAX_QDEPTH: usize = 128;

/// Maximum outstanding AIO requests per submission/completion queue pair.
pub const NVFUSE_MAX_AIO_DEPTH: usize = 1024;

/// Fixed size of one control-plane IPC message.
pub const NVFUSE_IPC_MSG_SIZE: usize = 128;

/// Default capacity of the buffer cache pool, in clusters.
pub const DEFAULT_BUFFER_POOL_CLUSTERS: usize = 4096;

/// Default capacity of the inode-context cache pool.
pub const DEFAULT_ICTX_POOL_SIZE: usize = 512;

/// Number of direct block pointers held inline in an inode.
pub const NUM_DIRECT_BLOCKS: usize = 8;

/// Pointers-per-cluster fanout of one indirect block (4096 / size_of::<u32>()).
pub const PTRS_PER_BLOCK: usize = CLUSTER_SIZE / core::mem::size_of::<u32>();

/// Maximum sector-addressable file size in clusters, direct + 3 levels of
/// indirection.
pub const MAX_FILE_CLUSTERS: u64 = NUM_DIRECT_BLOCKS as u64
    + PTRS_PER_BLOCK as u64
    + (PTRS_PER_BLOCK as u64) * (PTRS_PER_BLOCK as u64)
    + (PTRS_PER_BLOCK as u64) * (PTRS_PER_BLOCK as u64) * (PTRS_PER_BLOCK as u64);

/// Bits used to pack a dentry index into a B+-tree value alongside its
/// collision count (`spec.md` Glossary: "Slot").
pub const BPTREE_SLOT_INDEX_BITS: u32 = 26;
pub const BPTREE_SLOT_INDEX_MASK: u32 = (1 << BPTREE_SLOT_INDEX_BITS) - 1;
