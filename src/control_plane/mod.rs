//! Multi-process control plane: a primary process leases block groups,
//! buffer quota, and reservations to secondary processes over
//! shared-memory IPC rings (`spec.md` §4.9, §6).
//!
//! Feature-gated behind `control-plane` so a single-process embedder can
//! link the core filesystem without `memmap2`/`libc`. Grounded on the
//! pack's shared-memory transport idioms (`other_examples`' `fuse`-family
//! crates use `memmap2` for mapped buffers the same way); the message
//! format and protocol invariants are `spec.md` §4.9/§6 fresh design.

mod log;
mod protocol;
mod ring;

pub use log::{LogTable, TableLog};
pub use protocol::{IpcMessage, Opcode, ReservationMode, ReservationStatus};
pub use ring::SharedRing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{NvfuseError, Result};

/// `spec.md` §4.9: `app_manage_table[core_id] -> {channel, name, root_bg}`.
#[derive(Debug, Clone)]
pub struct AppEntry {
    pub core_id: u32,
    pub channel: u32,
    pub name: String,
    pub root_bg: u32,
}

/// `spec.md` §4.9: `reservation_table[bg_id] -> {owner_core, status, refcount}`.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub owner_core: Option<u32>,
    pub status: ReservationStatus,
    pub refcount: u32,
}

impl Default for Reservation {
    fn default() -> Self {
        Self { owner_core: None, status: ReservationStatus::Unlocked, refcount: 0 }
    }
}

struct PrimaryInner {
    apps: HashMap<u32, AppEntry>,
    reservations: HashMap<u32, Reservation>,
    bg_owner: HashMap<u32, u32>,
    free_bg_ids: Vec<u32>,
    buffer_quota_total: u64,
    buffer_quota_current: u64,
    next_channel: u32,
}

/// The primary process's authoritative view of leases and quota. Owns no
/// transport; `PrimaryState::handle` is the pure state machine a ring
/// listener drives with decoded [`IpcMessage`]s.
pub struct PrimaryState {
    inner: Mutex<PrimaryInner>,
    log_dir: Option<PathBuf>,
}

impl PrimaryState {
    pub fn new(bg_count: u32, buffer_quota_total: u64) -> Self {
        Self {
            inner: Mutex::new(PrimaryInner {
                apps: HashMap::new(),
                reservations: (0..bg_count).map(|id| (id, Reservation::default())).collect(),
                bg_owner: HashMap::new(),
                free_bg_ids: (0..bg_count).collect(),
                buffer_quota_total,
                buffer_quota_current: buffer_quota_total,
                next_channel: 1,
            }),
            log_dir: None,
        }
    }

    pub fn with_log_dir(bg_count: u32, buffer_quota_total: u64, log_dir: PathBuf) -> Self {
        let mut s = Self::new(bg_count, buffer_quota_total);
        s.log_dir = Some(log_dir);
        s
    }

    /// `APP_REGISTER`: assign a fresh channel id and record the app.
    pub fn register(&self, core_id: u32, name: &str) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.apps.contains_key(&core_id) {
            return Err(NvfuseError::ProtocolDenied("core already registered"));
        }
        let channel = inner.next_channel;
        inner.next_channel += 1;
        inner.apps.insert(
            core_id,
            AppEntry { core_id, channel, name: name.to_string(), root_bg: u32::MAX },
        );
        self.persist_apps(&inner);
        Ok(channel)
    }

    /// `APP_UNREGISTER`.
    pub fn unregister(&self, core_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.apps.remove(&core_id).ok_or(NvfuseError::ProtocolDenied("core not registered"))?;
        self.persist_apps(&inner);
        Ok(())
    }

    /// `CONTAINER_ALLOC(NEW)`: hand out a free BG, `owner=caller,
    /// status=ACQUIRED`.
    pub fn alloc_container_new(&self, core_id: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        let bg_id = inner.free_bg_ids.pop().ok_or(NvfuseError::NoSpace)?;
        inner.bg_owner.insert(bg_id, core_id);
        inner.reservations.insert(bg_id, Reservation { owner_core: Some(core_id), status: ReservationStatus::Acquired, refcount: 0 });
        self.persist_reservations(&inner);
        Ok(bg_id)
    }

    /// `CONTAINER_ALLOC(ALLOCATED)`: reattach to the next BG the caller
    /// already owns and which is currently `UNLOCKED` (used at mount to
    /// recover pre-existing containers).
    pub fn alloc_container_allocated(&self, core_id: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        let candidate = inner
            .bg_owner
            .iter()
            .find(|(bg_id, owner)| **owner == core_id && inner.reservations.get(bg_id).map(|r| r.status) == Some(ReservationStatus::Unlocked))
            .map(|(bg_id, _)| *bg_id);
        let bg_id = candidate.ok_or(NvfuseError::NotFound)?;
        inner.reservations.get_mut(&bg_id).unwrap().status = ReservationStatus::Acquired;
        self.persist_reservations(&inner);
        Ok(bg_id)
    }

    /// `CONTAINER_RELEASE`: clears ownership only if refcount is zero and
    /// the caller holds no reservation on it.
    pub fn release_container(&self, core_id: u32, bg_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let owner = *inner.bg_owner.get(&bg_id).ok_or(NvfuseError::NotFound)?;
        if owner != core_id {
            return Err(NvfuseError::ProtocolDenied("not the owning core"));
        }
        let res = inner.reservations.get(&bg_id).copied().unwrap_or_default();
        if res.refcount != 0 || res.status != ReservationStatus::Unlocked {
            return Err(NvfuseError::ProtocolDenied("container still reserved"));
        }
        inner.bg_owner.remove(&bg_id);
        inner.free_bg_ids.push(bg_id);
        self.persist_reservations(&inner);
        Ok(())
    }

    /// `CONTAINER_RESERVATION_ACQUIRE`: write succeeds only from
    /// `UNLOCKED`; read succeeds from `UNLOCKED` or `READ_LOCKED`
    /// (incrementing refcount).
    pub fn reservation_acquire(&self, core_id: u32, bg_id: u32, mode: ReservationMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = inner.reservations.get_mut(&bg_id).ok_or(NvfuseError::NotFound)?;
        match mode {
            ReservationMode::Write => {
                if res.status != ReservationStatus::Unlocked {
                    return Err(NvfuseError::ProtocolDenied("container not unlocked"));
                }
                res.status = ReservationStatus::WriteLocked;
                res.owner_core = Some(core_id);
                res.refcount = 1;
            }
            ReservationMode::Read => {
                if !matches!(res.status, ReservationStatus::Unlocked | ReservationStatus::ReadLocked) {
                    return Err(NvfuseError::ProtocolDenied("container locked for write"));
                }
                res.status = ReservationStatus::ReadLocked;
                res.refcount += 1;
            }
        }
        self.persist_reservations(&inner);
        Ok(())
    }

    pub fn reservation_release(&self, bg_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = inner.reservations.get_mut(&bg_id).ok_or(NvfuseError::NotFound)?;
        res.refcount = res.refcount.saturating_sub(1);
        if res.refcount == 0 {
            res.status = ReservationStatus::Unlocked;
            res.owner_core = None;
        }
        self.persist_reservations(&inner);
        Ok(())
    }

    /// `BUFFER_ALLOC(n)`: reduces quota by `n` and returns `n`, or `0` if
    /// insufficient (`spec.md` §4.9 — not an error, a zero-sized grant).
    pub fn buffer_alloc(&self, n: u64) -> u64 {
        let mut inner = self.inner.lock();
        if inner.buffer_quota_current >= n {
            inner.buffer_quota_current -= n;
            n
        } else {
            0
        }
    }

    pub fn buffer_free(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.buffer_quota_current = (inner.buffer_quota_current + n).min(inner.buffer_quota_total);
    }

    fn persist_apps(&self, inner: &PrimaryInner) {
        if let Some(dir) = &self.log_dir {
            let entries: Vec<_> = inner.apps.values().cloned().collect();
            let _ = log::write_app_table(dir, &entries);
        }
    }

    fn persist_reservations(&self, inner: &PrimaryInner) {
        if let Some(dir) = &self.log_dir {
            let entries: Vec<_> = inner.reservations.iter().map(|(id, r)| (*id, *r)).collect();
            let _ = log::write_container_table(dir, &entries);
        }
    }
}

/// A secondary's handle into the shared rings, addressed by `core_id`.
pub struct SecondaryChannel {
    pub core_id: u32,
    pub to_primary: Arc<SharedRing>,
    pub from_primary: Arc<SharedRing>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_alloc_new_container_grants_ownership() {
        let primary = PrimaryState::new(4, 1024);
        primary.register(7, "secondary-a").unwrap();
        let bg = primary.alloc_container_new(7).unwrap();
        assert!(primary.release_container(7, bg).is_ok());
    }

    #[test]
    fn release_with_outstanding_reservation_is_denied() {
        let primary = PrimaryState::new(2, 1024);
        primary.register(1, "a").unwrap();
        let bg = primary.alloc_container_new(1).unwrap();
        primary.reservation_acquire(1, bg, ReservationMode::Write).unwrap();
        assert!(primary.release_container(1, bg).is_err());
        primary.reservation_release(bg).unwrap();
        assert!(primary.release_container(1, bg).is_ok());
    }

    #[test]
    fn write_reservation_is_denied_while_another_core_holds_it() {
        let primary = PrimaryState::new(2, 1024);
        primary.register(1, "a").unwrap();
        primary.register(2, "b").unwrap();
        let bg = primary.alloc_container_new(1).unwrap();
        primary.reservation_acquire(1, bg, ReservationMode::Write).unwrap();
        assert!(primary.reservation_acquire(2, bg, ReservationMode::Read).is_err());
    }

    #[test]
    fn buffer_quota_denies_overallocation() {
        let primary = PrimaryState::new(1, 100);
        assert_eq!(primary.buffer_alloc(60), 60);
        assert_eq!(primary.buffer_alloc(60), 0);
        primary.buffer_free(60);
        assert_eq!(primary.buffer_alloc(60), 60);
    }
}
