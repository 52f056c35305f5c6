//! Error types for the shadowfs orchestrator

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::codec::{DecodeError, EncodeError};

/// Logical operations that fan out over segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentOp {
    MakeDir,
    Put,
    Placeholder,
    Move,
    Copy,
    Rename,
    Remove,
}

impl fmt::Display for SegmentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentOp::MakeDir => "make_dir",
            SegmentOp::Put => "put",
            SegmentOp::Placeholder => "placeholder",
            SegmentOp::Move => "move",
            SegmentOp::Copy => "copy",
            SegmentOp::Rename => "rename",
            SegmentOp::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// All errors surfaced by shadowfs operations.
#[derive(Debug, Error)]
pub enum ShadowError {
    /// The logical name cannot be represented under the segment bound.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// Physical names could not be reassembled.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// A single backend call failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// At least one segment operation failed; others may have succeeded.
    #[error("{op}: {failed} of {total} segment operations failed ({succeeded} succeeded): {source}")]
    PartialFailure {
        /// The fanned-out operation.
        op: SegmentOp,
        /// Failed segment operations.
        failed: usize,
        /// Succeeded segment operations.
        succeeded: usize,
        /// All segment operations.
        total: usize,
        /// First failure observed.
        #[source]
        source: BackendError,
    },
    /// Cancellation prevented some segment operations from starting.
    #[error("{op}: cancelled with {skipped} segment operations not started")]
    Cancelled {
        /// The fanned-out operation.
        op: SegmentOp,
        /// Segment operations never started.
        skipped: usize,
    },
    /// The synthetic root cannot be the source of a mutation.
    #[error("{op}: the root directory cannot be modified")]
    RootNotMutable {
        /// The rejected operation.
        op: SegmentOp,
    },
    /// A directory was required.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// Logical path.
        path: String,
    },
    /// A logical path could not be used.
    #[error("invalid path: {path}")]
    InvalidPath {
        /// The rejected path.
        path: String,
    },
    /// Configuration is invalid.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },
}

impl ShadowError {
    /// True when the error aggregates segment failures.
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, ShadowError::PartialFailure { .. })
    }
}

/// Result type alias using ShadowError as the error type.
pub type Result<T> = std::result::Result<T, ShadowError>;
