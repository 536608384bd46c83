//! Shared-memory message ring between a primary and one secondary
//! (`spec.md` §6: `PRI_TO_SEC_<chan>` / `SEC_TO_PRI_<chan>` mappings).
//!
//! Single-producer/single-consumer: each direction of a channel is backed
//! by its own mapping, so there is never a writer/writer race. Grounded on
//! the pack's `memmap2`-based shared-buffer idiom (`other_examples`' `fuse`
//! crates map a region once and hand out slices into it rather than
//! copying through a socket).

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::error::{NvfuseError, Result};

use super::protocol::IpcMessage;

const MSG_SIZE: usize = std::mem::size_of::<IpcMessage>();

#[repr(C)]
struct RingHeader {
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
}

const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// A fixed-capacity ring of [`IpcMessage`] frames mapped from a backing
/// file. `capacity` is the slot count, fixed for the file's lifetime.
pub struct SharedRing {
    mmap: MmapMut,
    capacity: u32,
}

impl SharedRing {
    /// Creates (or truncates) the backing file at `path` and maps it,
    /// sized for `capacity` slots plus the ring header.
    pub fn create(path: &Path, capacity: u32) -> Result<Self> {
        let len = HEADER_SIZE + capacity as usize * MSG_SIZE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| NvfuseError::Io)?;
        file.set_len(len as u64).map_err(|_| NvfuseError::Io)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|_| NvfuseError::Io)? };
        let header = header_mut(&mut mmap);
        header.capacity.store(capacity, Ordering::Relaxed);
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        Ok(Self { mmap, capacity })
    }

    /// Opens an existing ring a peer already created.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|_| NvfuseError::Io)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|_| NvfuseError::Io)? };
        let capacity = header_mut(&mut mmap).capacity.load(Ordering::Relaxed);
        Ok(Self { mmap, capacity })
    }

    /// Pushes one frame. Fails with `Exhausted` if the consumer hasn't
    /// caught up.
    pub fn push(&mut self, msg: &IpcMessage) -> Result<()> {
        let header = header_mut(&mut self.mmap);
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(NvfuseError::Exhausted("ipc ring"));
        }
        let slot = (head % self.capacity) as usize;
        let bytes: &[u8] = zerocopy::AsBytes::as_bytes(msg);
        let start = HEADER_SIZE + slot * MSG_SIZE;
        self.mmap[start..start + MSG_SIZE].copy_from_slice(bytes);
        header_mut(&mut self.mmap).head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pops the oldest unread frame, if any.
    pub fn pop(&mut self) -> Option<IpcMessage> {
        let header = header_mut(&mut self.mmap);
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let slot = (tail % self.capacity) as usize;
        let start = HEADER_SIZE + slot * MSG_SIZE;
        let msg = <IpcMessage as zerocopy::FromBytes>::read_from(&self.mmap[start..start + MSG_SIZE]).unwrap();
        header_mut(&mut self.mmap).tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(msg)
    }

    pub fn len(&self) -> u32 {
        let header = header_ref(&self.mmap);
        header.head.load(Ordering::Acquire).wrapping_sub(header.tail.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn header_mut(mmap: &mut MmapMut) -> &mut RingHeader {
    unsafe { &mut *(mmap.as_mut_ptr() as *mut RingHeader) }
}

fn header_ref(mmap: &MmapMut) -> &RingHeader {
    unsafe { &*(mmap.as_ptr() as *const RingHeader) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::Opcode;

    #[test]
    fn push_then_pop_round_trips_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut ring = SharedRing::create(&path, 4).unwrap();
        let mut msg = IpcMessage::default();
        msg.opcode = Opcode::AppRegister as i32;
        msg.core_id = 7;
        ring.push(&msg).unwrap();
        let popped = ring.pop().unwrap();
        assert_eq!(popped.core_id, 7);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_ring_rejects_further_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut ring = SharedRing::create(&path, 2).unwrap();
        let msg = IpcMessage::default();
        ring.push(&msg).unwrap();
        ring.push(&msg).unwrap();
        assert!(matches!(ring.push(&msg), Err(NvfuseError::Exhausted(_))));
    }

    #[test]
    fn a_second_handle_opening_the_same_file_sees_pushed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut writer = SharedRing::create(&path, 4).unwrap();
        let mut msg = IpcMessage::default();
        msg.core_id = 3;
        writer.push(&msg).unwrap();

        let mut reader = SharedRing::open(&path).unwrap();
        let popped = reader.pop().unwrap();
        assert_eq!(popped.core_id, 3);
    }
}
