//! Backing filesystem abstraction.
//!
//! A backend stores entries whose names are bounded in length. It offers
//! single-entry operations only; nothing here spans more than one entry
//! atomically.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Errors reported by a backend. The orchestrator only distinguishes
/// success from failure; the variants exist for callers and logs.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No entry at the path.
    #[error("not found: {path}")]
    NotFound {
        /// Path that was looked up.
        path: String,
    },
    /// An entry already occupies the path.
    #[error("already exists: {path}")]
    AlreadyExists {
        /// Path that was occupied.
        path: String,
    },
    /// A directory was required.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// Path that is not a directory.
        path: String,
    },
    /// The backend's name length bound was exceeded.
    #[error("name too long ({len} > {max}): {name}")]
    NameTooLong {
        /// The rejected name.
        name: String,
        /// Its length.
        len: usize,
        /// The backend limit.
        max: usize,
    },
    /// An upload was retried after its byte stream had been consumed.
    #[error("upload stream for {name} already consumed")]
    StreamConsumed {
        /// Name of the upload.
        name: String,
    },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other backend failure.
    #[error("backend error: {reason}")]
    Other {
        /// Failure details.
        reason: String,
    },
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One physical entry as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Leaf name.
    pub name: String,
    /// Full path on the backend.
    pub path: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Directory flag.
    pub is_dir: bool,
    /// Thumbnail URL if the backend provides one.
    pub thumbnail: Option<String>,
}

impl Entry {
    /// Directory entry with no size.
    pub fn dir(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size: 0,
            modified: SystemTime::now(),
            is_dir: true,
            thumbnail: None,
        }
    }

    /// File entry of the given size.
    pub fn file(name: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
            modified: SystemTime::now(),
            is_dir: false,
            thumbnail: None,
        }
    }
}

/// Byte stream handed to `put_stream`.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Upload progress callback, called with a percentage in `0.0..=100.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress sink that ignores updates.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Wrap in-memory bytes as a `ByteStream`.
pub fn byte_stream(data: impl Into<Vec<u8>>) -> ByteStream {
    Box::new(std::io::Cursor::new(data.into()))
}

/// Single-entry operations on a length-bounded filesystem.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// List the entries directly inside `path`.
    async fn list(&self, path: &str) -> BackendResult<Vec<Entry>>;

    /// Look up one entry.
    async fn get(&self, path: &str) -> BackendResult<Entry>;

    /// Create a directory. The parent must exist.
    async fn make_dir(&self, path: &str) -> BackendResult<()>;

    /// Move `src` into the directory `dst_dir`, keeping its name.
    async fn move_to(&self, src: &str, dst_dir: &str) -> BackendResult<()>;

    /// Rename `path` in place to `new_name`.
    async fn rename(&self, path: &str, new_name: &str) -> BackendResult<()>;

    /// Copy `src` into the directory `dst_dir`. Returns the new path.
    async fn copy_to(&self, src: &str, dst_dir: &str) -> BackendResult<String>;

    /// Remove an entry (recursively for directories).
    async fn remove(&self, path: &str) -> BackendResult<()>;

    /// Write `body` as `dir/name`, replacing any existing file.
    async fn put_stream(
        &self,
        dir: &str,
        name: &str,
        body: ByteStream,
        size_hint: u64,
        progress: ProgressFn,
    ) -> BackendResult<()>;
}
