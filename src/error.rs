//! Error types for the object cache.
//!
//! Malformed records and stale index entries are not errors; see
//! [`crate::Cache::load`]. Only genuine I/O failures and a handful of
//! structural problems surface here.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Canonical error surface for the object cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O operation against a segment file failed.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A segment file exists but does not start with the expected magic
    /// bytes. The original implementation silently reinterprets whatever
    /// bytes it finds; this crate refuses instead.
    #[error("segment file {path:?} has an invalid or missing magic header")]
    InvalidSegmentHeader { path: PathBuf },

    /// The var directory could not be created or is not writable.
    #[error("var directory {path:?} is not usable: {reason}")]
    VarDirUnavailable { path: PathBuf, reason: String },
}

impl From<std::io::Error> for CacheError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

impl CacheError {
    pub(crate) fn io(source: std::io::Error, path: &std::path::Path) -> Self {
        Self::Io {
            source,
            path: Some(path.to_path_buf()),
        }
    }
}
