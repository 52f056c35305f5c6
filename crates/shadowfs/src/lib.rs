//! ShadowFS: long logical names over filesystems with a short name limit.
//!
//! Name path: logical name → base64 → (if too long) hashed split segments `.sd.<hash>.<clash>.<total>.<index>.<payload>`
//! Object path: segment 0 holds content or directory, segments 1.. are placeholder files
//!
//! Every logical mutation fans out one backend call per segment and waits for
//! all of them; failed creates are rolled back by a background cleanup worker.

pub mod background;
pub mod backend;
pub mod clash;
pub mod codec;
pub mod config;
pub mod error;
pub mod fanout;
pub mod local;
pub mod memory;
pub mod object;
pub mod path;
pub mod retry;
pub mod shadow;
pub mod telemetry;

pub use backend::{byte_stream, no_progress, Backend, BackendError, BackendResult, ByteStream, Entry, ProgressFn};
pub use background::{CleanupConfig, CleanupHandle, CleanupStats, CleanupTask, CleanupWorker};
pub use clash::{ClashIndexAllocator, ClashIndexRegistry};
pub use codec::{DecodeError, EncodeError, GroupKey, SplitName};
pub use config::ShadowConfig;
pub use error::{SegmentOp, ShadowError};
pub use fanout::{FanoutConfig, FanoutExecutor, FanoutSummary, Outcome, SegmentOutcome, SegmentTask};
pub use local::LocalBackend;
pub use memory::{FaultOp, MemoryBackend};
pub use object::{LogicalObject, Placement};
pub use retry::RetryConfig;
pub use shadow::{ShadowFs, ThumbnailSigner, PLACEHOLDER_CONTENT};
pub use telemetry::init_tracing;
