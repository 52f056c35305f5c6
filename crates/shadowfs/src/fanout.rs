//! Segment fan-out: run one backend call per segment concurrently, wait for
//! all of them, and aggregate the outcome.
//!
//! A failed sibling never cancels the others. Cancellation is checked before
//! each queued segment operation starts; operations already in flight run to
//! completion and are still awaited.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendError, BackendResult};
use crate::error::{Result, SegmentOp, ShadowError};
use crate::retry::{retry, RetryConfig};

/// Future of one segment operation.
pub type SegmentFuture = BoxFuture<'static, BackendResult<()>>;

/// Configuration for segment fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Maximum concurrent segment operations per call (0 = unbounded).
    pub max_concurrency: usize,
    /// Retry policy for each segment operation.
    pub retry: RetryConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// One segment operation queued for fan-out.
pub struct SegmentTask {
    /// Segment position within its logical object.
    pub index: usize,
    /// Kind of operation, for logs and errors.
    pub op: SegmentOp,
    /// Backend path the operation targets or creates.
    pub path: String,
    job: Box<dyn FnMut() -> SegmentFuture + Send>,
}

impl SegmentTask {
    /// Wrap `job`; it is called once per attempt.
    pub fn new<F>(index: usize, op: SegmentOp, path: impl Into<String>, job: F) -> Self
    where
        F: FnMut() -> SegmentFuture + Send + 'static,
    {
        Self {
            index,
            op,
            path: path.into(),
            job: Box::new(job),
        }
    }
}

impl std::fmt::Debug for SegmentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTask")
            .field("index", &self.index)
            .field("op", &self.op)
            .field("path", &self.path)
            .finish()
    }
}

/// Result of a single segment operation.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Failed(BackendError),
    /// Not started because the call was cancelled.
    Skipped,
}

/// Outcome of one segment operation, with its identity.
#[derive(Debug)]
pub struct SegmentOutcome {
    pub index: usize,
    pub op: SegmentOp,
    pub path: String,
    pub outcome: Outcome,
}

/// Aggregate of a fan-out, in completion order.
#[derive(Debug)]
pub struct FanoutSummary {
    /// The logical operation.
    pub op: SegmentOp,
    /// Per-segment results in the order they were observed.
    pub results: Vec<SegmentOutcome>,
}

impl FanoutSummary {
    /// Number of segment operations.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of successful segment operations.
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Succeeded))
    }

    /// Number of failed segment operations.
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    /// Number of segment operations never started.
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped))
    }

    /// True if every segment operation succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded() == self.total()
    }

    /// Paths of every segment operation that was started.
    pub fn attempted_paths(&self) -> Vec<String> {
        let mut attempted: Vec<(usize, String)> = self
            .results
            .iter()
            .filter(|r| !matches!(r.outcome, Outcome::Skipped))
            .map(|r| (r.index, r.path.clone()))
            .collect();
        attempted.sort();
        attempted.into_iter().map(|(_, p)| p).collect()
    }

    /// Paths to remove when rolling back a failed create: every started
    /// operation except those refused because the target already existed.
    pub fn compensation_paths(&self) -> Vec<String> {
        let mut paths: Vec<(usize, String)> = self
            .results
            .iter()
            .filter(|r| match &r.outcome {
                Outcome::Succeeded => true,
                Outcome::Failed(BackendError::AlreadyExists { .. }) => false,
                Outcome::Failed(_) => true,
                Outcome::Skipped => false,
            })
            .map(|r| (r.index, r.path.clone()))
            .collect();
        paths.sort();
        paths.into_iter().map(|(_, p)| p).collect()
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    /// Collapse into a single result: any failure is a `PartialFailure`
    /// carrying the first observed error, a cancellation-only shortfall is
    /// `Cancelled`.
    pub fn into_result(self) -> Result<()> {
        let total = self.total();
        let succeeded = self.succeeded();
        let failed = self.failed();
        let skipped = self.skipped();
        let op = self.op;

        let first = self.results.into_iter().find_map(|r| match r.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        });
        match first {
            Some(source) => Err(ShadowError::PartialFailure {
                op,
                failed,
                succeeded,
                total,
                source,
            }),
            None if skipped > 0 => Err(ShadowError::Cancelled { op, skipped }),
            None => Ok(()),
        }
    }
}

/// Runs segment tasks concurrently.
#[derive(Debug, Clone, Default)]
pub struct FanoutExecutor {
    config: FanoutConfig,
}

impl FanoutExecutor {
    /// Create an executor with the given configuration.
    pub fn new(config: FanoutConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Run every task, wait for all of them and summarize.
    pub async fn run(&self, op: SegmentOp, tasks: Vec<SegmentTask>, cancel: &CancellationToken) -> FanoutSummary {
        let limiter = (self.config.max_concurrency > 0).then(|| Arc::new(Semaphore::new(self.config.max_concurrency)));
        let mut results = Vec::with_capacity(tasks.len());
        let mut spawned = Vec::with_capacity(tasks.len());
        let mut set = JoinSet::new();

        for mut task in tasks {
            if cancel.is_cancelled() {
                results.push(SegmentOutcome {
                    index: task.index,
                    op: task.op,
                    path: task.path,
                    outcome: Outcome::Skipped,
                });
                continue;
            }
            spawned.push((task.index, task.op, task.path.clone()));

            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let retry_config = self.config.retry.clone();
            set.spawn(async move {
                let _permit = match limiter {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = if cancel.is_cancelled() {
                    Outcome::Skipped
                } else {
                    let label = task.op.to_string();
                    match retry(&retry_config, &label, || (task.job)()).await {
                        Ok(()) => Outcome::Succeeded,
                        Err(e) => Outcome::Failed(e),
                    }
                };
                SegmentOutcome {
                    index: task.index,
                    op: task.op,
                    path: task.path,
                    outcome,
                }
            });
        }

        let mut reported = HashSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    match &result.outcome {
                        Outcome::Succeeded => debug!(%op, index = result.index, path = %result.path, "segment done"),
                        Outcome::Failed(e) => {
                            warn!(%op, index = result.index, path = %result.path, error = %e, "segment failed")
                        }
                        Outcome::Skipped => debug!(%op, index = result.index, path = %result.path, "segment skipped"),
                    }
                    reported.insert(result.index);
                    results.push(result);
                }
                Err(e) => warn!(%op, error = %e, "segment task aborted"),
            }
        }

        // a panicked task reports nothing; count it as failed
        for (index, seg_op, path) in spawned {
            if !reported.contains(&index) {
                results.push(SegmentOutcome {
                    index,
                    op: seg_op,
                    path,
                    outcome: Outcome::Failed(BackendError::Other {
                        reason: "segment task aborted".to_string(),
                    }),
                });
            }
        }

        FanoutSummary { op, results }
    }
}
