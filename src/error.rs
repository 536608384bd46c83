//! Error kinds shared across every layer of the file system.
//!
//! Low-level primitives (bitmap scans, buffer lookups) return `Option`/`bool`
//! and are translated into an [`NvfuseError`] at the first layer that knows
//! enough context to pick the right POSIX-flavored kind (`spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NvfuseError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file or directory already exists")]
    Exists,
    #[error("no space left on device")]
    NoSpace,
    #[error("device I/O error")]
    Io,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("superblock reports a previous crash; mount refused")]
    Crashed,
    #[error("file system is already mounted")]
    AlreadyMounted,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("control-plane request denied: {0}")]
    ProtocolDenied(&'static str),
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
}

pub type Result<T> = core::result::Result<T, NvfuseError>;

impl NvfuseError {
    /// The conventional negative errno-shaped return value user-facing
    /// entry points surface, per `spec.md` §7 ("negative on failure, zero
    /// on success").
    pub fn as_errno(self) -> i32 {
        match self {
            NvfuseError::NotFound => -2,        // ENOENT
            NvfuseError::Io => -5,              // EIO
            NvfuseError::BadFileDescriptor => -9, // EBADF
            NvfuseError::Exhausted(_) => -11,   // EAGAIN
            NvfuseError::Exists => -17,         // EEXIST
            NvfuseError::NotADirectory => -20,  // ENOTDIR
            NvfuseError::IsADirectory => -21,   // EISDIR
            NvfuseError::InvalidArgument => -22, // EINVAL
            NvfuseError::NoSpace => -28,        // ENOSPC
            NvfuseError::NameTooLong => -36,    // ENAMETOOLONG
            NvfuseError::NotEmpty => -39,       // ENOTEMPTY
            NvfuseError::AlreadyMounted => -16, // EBUSY
            NvfuseError::Crashed => -6,         // ENXIO
            NvfuseError::TooManyOpenFiles => -24, // EMFILE
            NvfuseError::ProtocolDenied(_) => -1, // EPERM
        }
    }
}
