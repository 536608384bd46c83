//! Block device interface.
//!
//! `spec.md` §1 treats the block device I/O reactor as an external
//! collaborator, "specified only by the interfaces it uses": cluster-sized
//! synchronous and vectored asynchronous read/write/flush. [`BlockDevice`]
//! is that interface; everything above it (buffer cache, AIO engine) only
//! ever talks to a `dyn BlockDevice`, never to a concrete reactor.
//!
//! [`FileBackedDevice`] is the one concrete implementation this crate
//! ships: a `std::fs::File`-backed device used by tests and by any
//! embedder that does not have a real NVMe user-space driver wired up.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{NvfuseError, Result};
use crate::param::CLUSTER_SIZE;

/// One 4 KiB device-level job, as fragmented by the AIO engine (`spec.md`
/// §3 "AIO request", §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Read,
    Write,
    Flush,
}

/// A single vectored job submitted to the reactor. Real job batching
/// merges adjacent LBN→PBN runs into one `iov`; this crate models that
/// with a `Vec<u8>` per job and lets the caller decide how many clusters
/// one job covers.
#[derive(Debug)]
pub struct DeviceJob {
    pub kind: JobKind,
    /// Physical cluster number of the first cluster in this job.
    pub start_cluster: u64,
    /// Job payload; for reads this is filled in by `complete`, for writes
    /// it is the data to write. Length must be a multiple of
    /// `CLUSTER_SIZE` (ignored for `Flush`).
    pub data: Vec<u8>,
}

/// Cluster-granular block device. A real implementation is a thin shim
/// over an NVMe user-space driver; `FileBackedDevice` below stands in for
/// it in tests.
pub trait BlockDevice: Send + Sync {
    /// Total addressable clusters on the device.
    fn cluster_count(&self) -> u64;

    /// Blocking single-cluster read.
    fn sync_read(&self, cluster: u64, buf: &mut [u8; CLUSTER_SIZE]) -> Result<()>;

    /// Blocking single-cluster write.
    fn sync_write(&self, cluster: u64, buf: &[u8; CLUSTER_SIZE]) -> Result<()>;

    /// Submit a (possibly multi-cluster) job and block until it completes.
    /// The default implementation fragments into `sync_read`/`sync_write`
    /// calls; a real reactor instead queues `req` and returns once its
    /// callback fires (`spec.md` §4.8).
    fn submit(&self, job: &mut DeviceJob) -> Result<()> {
        match job.kind {
            JobKind::Flush => self.flush(),
            JobKind::Read => {
                let clusters = job.data.len() / CLUSTER_SIZE;
                for i in 0..clusters {
                    let mut tmp = [0u8; CLUSTER_SIZE];
                    self.sync_read(job.start_cluster + i as u64, &mut tmp)?;
                    job.data[i * CLUSTER_SIZE..(i + 1) * CLUSTER_SIZE].copy_from_slice(&tmp);
                }
                Ok(())
            }
            JobKind::Write => {
                let clusters = job.data.len() / CLUSTER_SIZE;
                for i in 0..clusters {
                    let mut tmp = [0u8; CLUSTER_SIZE];
                    tmp.copy_from_slice(&job.data[i * CLUSTER_SIZE..(i + 1) * CLUSTER_SIZE]);
                    self.sync_write(job.start_cluster + i as u64, &tmp)?;
                }
                Ok(())
            }
        }
    }

    /// Device-level flush (FUA). `spec.md` §4.1: a flush follows every
    /// drained dirty-buffer batch.
    fn flush(&self) -> Result<()>;
}

/// `std::fs::File`-backed block device used by tests and single-process
/// embedders. Thread-safe via an internal mutex, mirroring the
/// coarse-grained locking the rest of the crate applies around shared
/// structures (`spec.md` §5).
pub struct FileBackedDevice {
    file: Mutex<File>,
    clusters: u64,
}

impl FileBackedDevice {
    /// Create (or truncate) a file-backed device of exactly `clusters`
    /// clusters.
    pub fn create(path: impl AsRef<Path>, clusters: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| NvfuseError::Io)?;
        file.set_len(clusters * CLUSTER_SIZE as u64)
            .map_err(|_| NvfuseError::Io)?;
        Ok(Self {
            file: Mutex::new(file),
            clusters,
        })
    }

    /// Open an existing device image, sizing `clusters` from the file length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| NvfuseError::Io)?;
        let len = file.metadata().map_err(|_| NvfuseError::Io)?.len();
        Ok(Self {
            file: Mutex::new(file),
            clusters: len / CLUSTER_SIZE as u64,
        })
    }
}

impl BlockDevice for FileBackedDevice {
    fn cluster_count(&self) -> u64 {
        self.clusters
    }

    fn sync_read(&self, cluster: u64, buf: &mut [u8; CLUSTER_SIZE]) -> Result<()> {
        if cluster >= self.clusters {
            return Err(NvfuseError::InvalidArgument);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(cluster * CLUSTER_SIZE as u64))
            .map_err(|_| NvfuseError::Io)?;
        file.read_exact(buf).map_err(|_| NvfuseError::Io)
    }

    fn sync_write(&self, cluster: u64, buf: &[u8; CLUSTER_SIZE]) -> Result<()> {
        if cluster >= self.clusters {
            return Err(NvfuseError::InvalidArgument);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(cluster * CLUSTER_SIZE as u64))
            .map_err(|_| NvfuseError::Io)?;
        file.write_all(buf).map_err(|_| NvfuseError::Io)
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().unwrap().flush().map_err(|_| NvfuseError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileBackedDevice::create(dir.path().join("img"), 16).unwrap();
        let mut out = [7u8; CLUSTER_SIZE];
        dev.sync_write(3, &[9u8; CLUSTER_SIZE]).unwrap();
        dev.sync_read(3, &mut out).unwrap();
        assert_eq!(out, [9u8; CLUSTER_SIZE]);
    }

    #[test]
    fn rejects_out_of_range_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileBackedDevice::create(dir.path().join("img"), 4).unwrap();
        let mut out = [0u8; CLUSTER_SIZE];
        assert_eq!(dev.sync_read(4, &mut out), Err(NvfuseError::InvalidArgument));
    }
}
