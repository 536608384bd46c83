//! Inode-context (ICTX) cache (`spec.md` §3 "Inode context", §4.2).
//!
//! Every live inode is represented by exactly one [`InodeContext`], pooled
//! and reference-counted the same way the buffer cache pools clusters: a
//! fixed-capacity table keyed by `ino`, evicted LRU from the unreferenced
//! tail, with dirty contexts retained (never evicted) until their owning
//! inode record has been written back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::bgtable::BgTable;
use crate::buffer::{BufHandle, BufferCache};
use crate::error::{NvfuseError, Result};
use crate::layout::Inode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IctxStatus {
    New,
    Clean,
    Dirty,
}

struct Slot {
    ino: Option<u32>,
    inode: Inode,
    /// The inode table cluster this record lives in, held open for as long
    /// as the context is dirty so `sync` doesn't have to re-resolve it.
    itable_bh: Option<BufHandle>,
    status: IctxStatus,
    ref_count: u32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            ino: None,
            inode: Inode::default(),
            itable_bh: None,
            status: IctxStatus::Clean,
            ref_count: 0,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    index: HashMap<u32, usize>,
    unused: VecDeque<usize>,
    lru: VecDeque<usize>,
}

/// Pooled cache of inode records, addressed by `ino`. Holds no knowledge of
/// file content — block-level I/O goes through [`crate::indirect`], which
/// borrows the cached [`Inode::blocks`] map from a handle obtained here.
pub struct IctxCache {
    bg_table: Arc<BgTable>,
    bc: Arc<BufferCache>,
    inner: Mutex<Inner>,
}

/// A per-operation handle to a cached inode context (`spec.md` §4.2
/// `ictx_get`/`ictx_put`). Dropping it releases the reference; the context
/// itself stays resident until evicted or explicitly synced and dropped at
/// zero refcount while clean.
pub struct IctxHandle {
    cache: Arc<IctxCache>,
    slot: usize,
    ino: u32,
}

impl IctxCache {
    pub fn new(bg_table: Arc<BgTable>, bc: Arc<BufferCache>, capacity: usize) -> Arc<Self> {
        let mut slots = Vec::with_capacity(capacity);
        let mut unused = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot::empty());
            unused.push_back(i);
        }
        Arc::new(Self {
            bg_table,
            bc,
            inner: Mutex::new(Inner {
                slots,
                index: HashMap::new(),
                unused,
                lru: VecDeque::new(),
            }),
        })
    }

    fn load_locked(bg_table: &BgTable, bc: &Arc<BufferCache>, ino: u32) -> Result<(Inode, BufHandle)> {
        let (pno, offset) = bg_table.itable_location(ino).ok_or(NvfuseError::InvalidArgument)?;
        let lbn = ino / crate::bgtable::ENTRIES_PER_BLOCK;
        let bh = bc.get_bh(crate::param::ITABLE_INO, lbn, pno, true, true)?;
        let inode = bh.read(|data| {
            Inode::read_from(&data[offset..offset + crate::param::INODE_ENTRY_SIZE]).unwrap_or_default()
        });
        Ok((inode, bh))
    }

    fn evict_one(inner: &mut Inner) -> Option<usize> {
        if let Some(idx) = inner.unused.pop_front() {
            return Some(idx);
        }
        while let Some(idx) = inner.lru.pop_front() {
            if inner.slots[idx].ref_count == 0 && inner.slots[idx].status != IctxStatus::Dirty {
                inner.index.remove(&inner.slots[idx].ino.unwrap());
                return Some(idx);
            }
        }
        None
    }

    /// `ictx_get`: return the cached context for `ino`, loading it from the
    /// inode table on a miss.
    pub fn get(self: &Arc<Self>, ino: u32) -> Result<IctxHandle> {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&ino) {
            inner.slots[idx].ref_count += 1;
            return Ok(IctxHandle {
                cache: Arc::clone(self),
                slot: idx,
                ino,
            });
        }

        let idx = loop {
            if let Some(idx) = Self::evict_one(&mut inner) {
                break idx;
            }
            return Err(NvfuseError::Exhausted("inode context cache"));
        };

        let (inode, bh) = Self::load_locked(&self.bg_table, &self.bc, ino)?;
        let slot = &mut inner.slots[idx];
        slot.ino = Some(ino);
        slot.inode = inode;
        slot.itable_bh = Some(bh);
        slot.status = IctxStatus::Clean;
        slot.ref_count = 1;
        inner.index.insert(ino, idx);

        Ok(IctxHandle {
            cache: Arc::clone(self),
            slot: idx,
            ino,
        })
    }

    /// `ictx_new`: seed a freshly-allocated inode's context without reading
    /// its (still-zeroed) table slot back from disk.
    pub fn new_context(self: &Arc<Self>, ino: u32, inode: Inode) -> Result<IctxHandle> {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.index.contains_key(&ino));

        let idx = loop {
            if let Some(idx) = Self::evict_one(&mut inner) {
                break idx;
            }
            return Err(NvfuseError::Exhausted("inode context cache"));
        };

        let (pno, _offset) = self.bg_table.itable_location(ino).ok_or(NvfuseError::InvalidArgument)?;
        let lbn = ino / crate::bgtable::ENTRIES_PER_BLOCK;
        let bh = self.bc.get_bh(crate::param::ITABLE_INO, lbn, pno, true, true)?;

        let slot = &mut inner.slots[idx];
        slot.ino = Some(ino);
        slot.inode = inode;
        slot.itable_bh = Some(bh);
        slot.status = IctxStatus::New;
        slot.ref_count = 1;
        inner.index.insert(ino, idx);

        Ok(IctxHandle {
            cache: Arc::clone(self),
            slot: idx,
            ino,
        })
    }

    /// Write every `New`/`Dirty` context's inode record back to its itable
    /// cluster (`spec.md` §4.2 `ictx_sync`, driven by `fsync`/`umount`).
    pub fn sync_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for idx in 0..inner.slots.len() {
            if inner.slots[idx].ino.is_none() || inner.slots[idx].status == IctxStatus::Clean {
                continue;
            }
            self.write_back(&inner.slots[idx])?;
            if let Some(bh) = &inner.slots[idx].itable_bh {
                self.bc.flush_handle(bh)?;
            }
            inner.slots[idx].status = IctxStatus::Clean;
        }
        Ok(())
    }

    fn write_back(&self, slot: &Slot) -> Result<()> {
        let (_pno, offset) = self
            .bg_table
            .itable_location(slot.ino.unwrap())
            .ok_or(NvfuseError::InvalidArgument)?;
        let bh = slot.itable_bh.as_ref().ok_or(NvfuseError::Io)?;
        bh.write(|data| {
            data[offset..offset + crate::param::INODE_ENTRY_SIZE].copy_from_slice(slot.inode.as_bytes());
        });
        Ok(())
    }

    fn release(&self, idx: usize) {
        let mut inner = self.inner.lock();
        inner.slots[idx].ref_count = inner.slots[idx].ref_count.saturating_sub(1);
        if inner.slots[idx].ref_count == 0 {
            inner.lru.push_back(idx);
        }
    }
}

impl IctxHandle {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn inode(&self) -> Inode {
        self.cache.inner.lock().slots[self.slot].inode
    }

    pub fn with_inode<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut inner = self.cache.inner.lock();
        let slot = &mut inner.slots[self.slot];
        let r = f(&mut slot.inode);
        if slot.status == IctxStatus::Clean {
            slot.status = IctxStatus::Dirty;
        }
        r
    }

    /// Flush just this context's record, without waiting for `sync_all`.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.cache.inner.lock();
        let idx = self.slot;
        if inner.slots[idx].status == IctxStatus::Clean {
            return Ok(());
        }
        self.cache.write_back(&inner.slots[idx])?;
        if let Some(bh) = &inner.slots[idx].itable_bh {
            self.cache.bc.flush_handle(bh)?;
        }
        inner.slots[idx].status = IctxStatus::Clean;
        Ok(())
    }
}

impl Drop for IctxHandle {
    fn drop(&mut self) {
        self.cache.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, FileBackedDevice};
    use crate::layout::BgDescriptor;
    use crate::param::INODE_ENTRY_SIZE;

    fn setup() -> Arc<IctxCache> {
        let dir = tempfile::tempdir().unwrap();
        let dev: Arc<dyn BlockDevice> = Arc::new(FileBackedDevice::create(dir.path().join("img"), 4096).unwrap());
        std::mem::forget(dir);
        let bc = BufferCache::new(dev, 64);
        let inodes_per_bg = (4096 / INODE_ENTRY_SIZE) as u32; // one itable cluster per bg
        let descriptors = vec![BgDescriptor::new(0, 0, 1, 2, 3, 10, inodes_per_bg, 1024)];
        let bg_table = Arc::new(BgTable::new(descriptors, inodes_per_bg, 1024));
        IctxCache::new(bg_table, bc, 8)
    }

    #[test]
    fn new_context_round_trips_through_sync_and_reload() {
        let cache = setup();
        let ino = 1u32;
        {
            let mut inode = Inode::default();
            inode.ino = ino;
            inode.size = 4096;
            let handle = cache.new_context(ino, inode).unwrap();
            handle.sync().unwrap();
        }
        let reloaded = cache.get(ino).unwrap();
        assert_eq!(reloaded.inode().size, 4096);
    }

    #[test]
    fn with_inode_marks_the_context_dirty() {
        let cache = setup();
        let ino = 1u32;
        let handle = cache.new_context(ino, Inode::default()).unwrap();
        handle.sync().unwrap(); // clean
        handle.with_inode(|i| i.size = 77);
        drop(handle);
        cache.sync_all().unwrap();
        let reloaded = cache.get(ino).unwrap();
        assert_eq!(reloaded.inode().size, 77);
    }
}
