//! Rotating on-disk snapshots of the primary's lease tables (`spec.md`
//! §6: `app_table_<0|1>.file` / `container_table_<0|1>.file` pairs, each
//! prefixed by a monotonic generation number so a reader always has one
//! complete, non-torn copy to fall back on).

use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use super::{AppEntry, Reservation};
use crate::error::{NvfuseError, Result};

/// Which of the two rotating slots a table last wrote to, plus the
/// generation number stamped into that slot's header.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableLog {
    pub slot: u8,
    pub generation: u64,
}

/// A rotating two-slot table under `dir/<stem>_<0|1>.file`. Stateless
/// across calls — rotation is derived by reading both slots' generation
/// headers back off disk, since callers construct a fresh `LogTable` per
/// write rather than holding one open for the table's lifetime.
pub struct LogTable {
    dir: PathBuf,
    stem: &'static str,
}

fn slot_generation(path: &Path) -> u64 {
    let mut buf = [0u8; 8];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut buf)) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => 0,
    }
}

impl LogTable {
    pub fn new(dir: PathBuf, stem: &'static str) -> Self {
        Self { dir, stem }
    }

    fn slot_path(&self, slot: u8) -> PathBuf {
        self.dir.join(format!("{}_{}.file", self.stem, slot))
    }

    /// Writes `body` into whichever slot currently holds the older
    /// generation, prefixed by an 8-byte generation number one past the
    /// newer slot's.
    fn write(&self, body: &[u8]) -> Result<TableLog> {
        fs::create_dir_all(&self.dir).map_err(|_| NvfuseError::Io)?;
        let gen0 = slot_generation(&self.slot_path(0));
        let gen1 = slot_generation(&self.slot_path(1));
        let (target_slot, generation) = if gen0 <= gen1 { (0u8, gen1 + 1) } else { (1u8, gen0 + 1) };
        let path = self.slot_path(target_slot);
        let mut file = fs::File::create(&path).map_err(|_| NvfuseError::Io)?;
        file.write_all(&generation.to_le_bytes()).map_err(|_| NvfuseError::Io)?;
        file.write_all(body).map_err(|_| NvfuseError::Io)?;
        file.sync_all().map_err(|_| NvfuseError::Io)?;
        Ok(TableLog { slot: target_slot, generation })
    }
}

/// Serializes the app table as fixed `core_id:channel:root_bg:name`
/// lines and rotates it into `app_table_<0|1>.file`.
pub fn write_app_table(dir: &Path, apps: &[AppEntry]) -> Result<TableLog> {
    let table = LogTable::new(dir.to_path_buf(), "app_table");
    let mut body = String::new();
    for app in apps {
        body.push_str(&format!("{}:{}:{}:{}\n", app.core_id, app.channel, app.root_bg, app.name));
    }
    table.write(body.as_bytes())
}

/// Serializes the reservation/container table as
/// `bg_id:owner_core:status:refcount` lines and rotates it into
/// `container_table_<0|1>.file`.
pub fn write_container_table(dir: &Path, reservations: &[(u32, Reservation)]) -> Result<TableLog> {
    let table = LogTable::new(dir.to_path_buf(), "container_table");
    let mut body = String::new();
    for (bg_id, res) in reservations {
        body.push_str(&format!(
            "{}:{}:{:?}:{}\n",
            bg_id,
            res.owner_core.map(|c| c as i64).unwrap_or(-1),
            res.status,
            res.refcount
        ));
    }
    table.write(body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_write_rotates_to_the_other_slot_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![AppEntry { core_id: 1, channel: 1, name: "a".into(), root_bg: 0 }];
        let first = write_app_table(dir.path(), &apps).unwrap();
        let second = write_app_table(dir.path(), &apps).unwrap();
        assert_ne!(first.slot, second.slot);
        assert!(second.generation > first.generation);
        assert!(dir.path().join("app_table_0.file").exists());
        assert!(dir.path().join("app_table_1.file").exists());
    }
}
