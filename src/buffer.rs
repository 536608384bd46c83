//! Buffer cache (BC) and buffer head (BH) — `spec.md` §4.1.
//!
//! A fixed-capacity pool of 4 KiB frames keyed by `(is_meta, ino, lbn)`,
//! with LRU eviction from `{Unused, Clean}` and forced flush of `Dirty`
//! when those run out. Physical-cluster translation (the indirect map for
//! regular inodes, the fixed formulas for reserved inodes) happens in the
//! caller (`indirect.rs`, `bitmap.rs`, `ictx.rs`) — the cache itself only
//! ever deals in an already-resolved physical cluster number, grounded on
//! the teacher's `bio.rs` split between `Bcache::get_buf` (keying/eviction)
//! and `hal().disk()` (the actual transfer).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::BlockDevice;
use crate::error::{NvfuseError, Result};
use crate::param::CLUSTER_SIZE;

/// Packs `(is_meta, ino, lbn)` into the 64-bit key described in `spec.md`
/// §2 component 2: `type<<62 | ino<<32 | lbn`.
pub fn make_key(is_meta: bool, ino: u32, lbn: u32) -> u64 {
    ((is_meta as u64) << 62) | ((ino as u64) << 32) | (lbn as u64)
}

pub fn key_ino(key: u64) -> u32 {
    ((key >> 32) & 0xffff_ffff) as u32
}

pub fn key_lbn(key: u64) -> u32 {
    (key & 0xffff_ffff) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListType {
    Unused,
    Ref,
    Clean,
    Dirty,
    Flushing,
}

struct BcSlot {
    key: Option<u64>,
    pno: u64,
    data: Box<[u8; CLUSTER_SIZE]>,
    loaded: bool,
    dirty: bool,
    ref_count: u32,
    state: ListType,
}

impl BcSlot {
    fn empty() -> Self {
        Self {
            key: None,
            pno: 0,
            data: Box::new([0u8; CLUSTER_SIZE]),
            loaded: false,
            dirty: false,
            ref_count: 0,
            state: ListType::Unused,
        }
    }
}

struct Inner {
    slots: Vec<BcSlot>,
    key_index: HashMap<u64, usize>,
    unused: VecDeque<usize>,
    clean: VecDeque<usize>,
    dirty: VecDeque<usize>,
}

/// Fixed-size pool of cached clusters shared by every inode context in
/// this process.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<Inner>,
}

/// A per-operation handle to a cached cluster. Dropping it returns the
/// slot to the `Clean`/`Dirty` list and decrements its reference count
/// (`spec.md` §4.1 `release_bh`). To keep a dirty buffer attached to an
/// inode context's dirty list beyond the call that dirtied it, retain the
/// `BufHandle` itself (see `ictx.rs`) instead of dropping it.
pub struct BufHandle {
    cache: Arc<BufferCache>,
    slot: usize,
    key: u64,
    released: bool,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Arc<Self> {
        let mut slots = Vec::with_capacity(capacity);
        let mut unused = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(BcSlot::empty());
            unused.push_back(i);
        }
        Arc::new(Self {
            device,
            inner: Mutex::new(Inner {
                slots,
                key_index: HashMap::new(),
                unused,
                clean: VecDeque::new(),
                dirty: VecDeque::new(),
            }),
        })
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    fn evict_one(inner: &mut Inner) -> Option<usize> {
        if let Some(idx) = inner.unused.pop_front() {
            return Some(idx);
        }
        // A slot can be re-referenced by a cache hit while still sitting in
        // the `clean` LRU from a previous release; skip those rather than
        // evicting a buffer that is actually in use.
        while let Some(idx) = inner.clean.pop_front() {
            if inner.slots[idx].ref_count == 0 {
                inner.key_index.remove(&inner.slots[idx].key.unwrap());
                return Some(idx);
            }
        }
        None
    }

    /// `get_bh`/`get_new_bh` (`spec.md` §4.1). `pno` must already be the
    /// resolved physical cluster; `zero` skips the read-through and marks
    /// the buffer dirty immediately (`get_new_bh`).
    fn acquire(
        self: &Arc<Self>,
        ino: u32,
        lbn: u32,
        pno: u64,
        is_meta: bool,
        sync_read: bool,
        zero: bool,
    ) -> Result<BufHandle> {
        let key = make_key(is_meta, ino, lbn);
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.key_index.get(&key) {
            let slot = &mut inner.slots[idx];
            slot.ref_count += 1;
            slot.state = ListType::Ref;
            return Ok(BufHandle {
                cache: Arc::clone(self),
                slot: idx,
                key,
                released: false,
            });
        }

        // Evict until a slot is free, flushing dirty entries if needed
        // (`spec.md` §4.1 "Eviction policy").
        let idx = loop {
            if let Some(idx) = Self::evict_one(&mut inner) {
                break idx;
            }
            if inner.dirty.is_empty() {
                return Err(NvfuseError::Exhausted("buffer cache"));
            }
            Self::flush_locked(&self.device, &mut inner, usize::MAX)?;
        };

        {
            let slot = &mut inner.slots[idx];
            slot.key = Some(key);
            slot.pno = pno;
            slot.ref_count = 1;
            slot.state = ListType::Ref;
            if zero {
                slot.data.fill(0);
                slot.loaded = true;
                // `get_new_bh` zeroes and skips the read-through, but the
                // zeroed content only exists in memory until it's written
                // back — mark dirty immediately so a release without a
                // follow-up write still reaches disk.
                slot.dirty = true;
            } else {
                slot.loaded = false;
                slot.dirty = false;
            }
        }
        inner.key_index.insert(key, idx);

        if !zero && sync_read {
            let mut buf = [0u8; CLUSTER_SIZE];
            let read = self.device.sync_read(pno, &mut buf);
            match read {
                Ok(()) => {
                    let slot = &mut inner.slots[idx];
                    slot.data.copy_from_slice(&buf);
                    slot.loaded = true;
                }
                Err(e) => {
                    // Release without marking loaded (`spec.md` §4.1 "Failure").
                    let slot = &mut inner.slots[idx];
                    slot.ref_count = 0;
                    slot.key = None;
                    inner.key_index.remove(&key);
                    inner.unused.push_back(idx);
                    return Err(e);
                }
            }
        }

        Ok(BufHandle {
            cache: Arc::clone(self),
            slot: idx,
            key,
            released: false,
        })
    }

    pub fn get_bh(
        self: &Arc<Self>,
        ino: u32,
        lbn: u32,
        pno: u64,
        is_meta: bool,
        sync_read: bool,
    ) -> Result<BufHandle> {
        self.acquire(ino, lbn, pno, is_meta, sync_read, false)
    }

    pub fn get_new_bh(self: &Arc<Self>, ino: u32, lbn: u32, pno: u64, is_meta: bool) -> Result<BufHandle> {
        self.acquire(ino, lbn, pno, is_meta, false, true)
    }

    fn flush_locked(device: &Arc<dyn BlockDevice>, inner: &mut Inner, max: usize) -> Result<usize> {
        let mut flushed = 0;
        while flushed < max {
            let idx = match inner.dirty.pop_front() {
                Some(idx) => idx,
                None => break,
            };
            let (pno, data) = {
                let slot = &inner.slots[idx];
                (slot.pno, *slot.data.clone())
            };
            device.sync_write(pno, &data)?;
            let slot = &mut inner.slots[idx];
            slot.dirty = false;
            slot.state = if slot.ref_count == 0 { ListType::Clean } else { ListType::Ref };
            if slot.ref_count == 0 {
                inner.clean.push_back(idx);
            }
            flushed += 1;
        }
        if flushed > 0 {
            device.flush()?;
        }
        Ok(flushed)
    }

    /// `check_flush_dirty`: drain up to `max` dirty buffers and issue a
    /// device flush (`spec.md` §4.1, §4.8 `AIO_MAX_QDEPTH`).
    pub fn check_flush_dirty(&self, max: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        Self::flush_locked(&self.device, &mut inner, max)
    }

    /// Flush one specific handle's data without waiting for it to reach
    /// the front of the dirty LRU (used by `fsync`, `spec.md` §4.6).
    pub fn flush_handle(&self, bh: &BufHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let (pno, data, was_dirty) = {
            let slot = &inner.slots[bh.slot];
            (slot.pno, *slot.data.clone(), slot.dirty)
        };
        if !was_dirty {
            return Ok(());
        }
        self.device.sync_write(pno, &data)?;
        let slot = &mut inner.slots[bh.slot];
        slot.dirty = false;
        if let Some(pos) = inner.dirty.iter().position(|&i| i == bh.slot) {
            inner.dirty.remove(pos);
        }
        Ok(())
    }

    fn release(&self, slot: usize, key: u64, dirty: bool) {
        let mut inner = self.inner.lock();
        {
            let s = &mut inner.slots[slot];
            debug_assert_eq!(s.key, Some(key));
            s.ref_count = s.ref_count.saturating_sub(1);
            if dirty {
                s.dirty = true;
            }
        }
        let s = &inner.slots[slot];
        if s.ref_count > 0 {
            return;
        }
        if s.dirty {
            inner.slots[slot].state = ListType::Dirty;
            inner.dirty.push_back(slot);
        } else {
            inner.slots[slot].state = ListType::Clean;
            inner.clean.push_back(slot);
        }
    }
}

impl BufHandle {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn ino(&self) -> u32 {
        key_ino(self.key)
    }

    pub fn lbn(&self) -> u32 {
        key_lbn(self.key)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8; CLUSTER_SIZE]) -> R) -> R {
        let inner = self.cache.inner.lock();
        f(&inner.slots[self.slot].data)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8; CLUSTER_SIZE]) -> R) -> R {
        let mut inner = self.cache.inner.lock();
        let slot = &mut inner.slots[self.slot];
        let r = f(&mut slot.data);
        slot.dirty = true;
        slot.loaded = true;
        r
    }

    pub fn mark_dirty(&self) {
        let mut inner = self.cache.inner.lock();
        inner.slots[self.slot].dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.inner.lock().slots[self.slot].dirty
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.inner.lock().slots[self.slot].loaded
    }

    /// Explicitly release, choosing whether the buffer is handed back
    /// dirty (`spec.md` §4.1 `release_bh(bh, tail, dirty)`; `tail` is
    /// modeled by LRU push order alone here).
    pub fn release(mut self, dirty: bool) {
        self.cache.release(self.slot, self.key, dirty || self.is_dirty_flag());
        self.released = true;
    }

    fn is_dirty_flag(&self) -> bool {
        self.cache.inner.lock().slots[self.slot].dirty
    }
}

impl Drop for BufHandle {
    fn drop(&mut self) {
        if !self.released {
            let dirty = self.is_dirty_flag();
            self.cache.release(self.slot, self.key, dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBackedDevice;

    fn cache(capacity: usize) -> Arc<BufferCache> {
        let dir = tempfile::tempdir().unwrap();
        let dev: Arc<dyn BlockDevice> =
            Arc::new(FileBackedDevice::create(dir.path().join("img"), 64).unwrap());
        std::mem::forget(dir); // keep the backing file alive for the test
        BufferCache::new(dev, capacity)
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let bc = cache(4);
        {
            let bh = bc.get_new_bh(1, 0, 5, false).unwrap();
            bh.write(|d| d[0] = 42);
        }
        let bh = bc.get_bh(1, 0, 5, false, true).unwrap();
        bh.read(|d| assert_eq!(d[0], 42));
    }

    #[test]
    fn cache_hit_reuses_the_same_slot() {
        let bc = cache(4);
        let a = bc.get_new_bh(1, 0, 5, false).unwrap();
        let b = bc.get_bh(1, 0, 5, false, false).unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn eviction_flushes_dirty_buffers_when_pool_is_full() {
        let bc = cache(2);
        let a = bc.get_new_bh(1, 0, 0, false).unwrap();
        a.write(|d| d[0] = 1);
        drop(a);
        let b = bc.get_new_bh(1, 1, 1, false).unwrap();
        b.write(|d| d[0] = 2);
        drop(b);
        // Pool is full of dirty entries; a third distinct key forces a flush.
        let c = bc.get_new_bh(1, 2, 2, false).unwrap();
        drop(c);
        let reread = bc.get_bh(1, 0, 0, false, true).unwrap();
        reread.read(|d| assert_eq!(d[0], 1));
    }
}
