//! NVFUSE: a userspace file system layered over a raw block device.
//!
//! Dependency order mirrors the ten components this crate is built from:
//! on-disk layout, buffer cache, inode-context cache, bitmap allocator,
//! indirect block map, per-directory B+-tree index, directory operations,
//! path resolution/namespace, the open-file table, the asynchronous I/O
//! engine, and (optionally) the multi-process control plane. [`fs`] ties
//! all of them into one `Filesystem` handle via `format`/`mount`.

pub mod aio;
pub mod bgtable;
pub mod bitmap;
pub mod bptree;
pub mod buffer;
#[cfg(feature = "control-plane")]
pub mod control_plane;
pub mod device;
pub mod directory;
pub mod error;
pub mod file;
pub mod fs;
pub mod ictx;
pub mod indirect;
pub mod layout;
pub mod namespace;
pub mod param;

pub use device::{BlockDevice, FileBackedDevice};
pub use error::{NvfuseError, Result};
pub use file::{FileHandle, OpenFlags};
pub use fs::{Filesystem, FormatOptions, MountOptions};
