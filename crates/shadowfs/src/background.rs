//! Background cleanup worker for compensation after partial failures.
//!
//! Callers submit removal work and return immediately; the worker removes the
//! paths best-effort, logs what it could not remove and publishes running
//! statistics on a watch channel. Nothing it does is reported back to the
//! call that triggered it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::retry::{retry, RetryConfig};

/// A work item for the cleanup worker.
#[derive(Debug)]
pub enum CleanupTask {
    /// Remove every path, concurrently.
    Remove {
        /// Backend paths to remove.
        paths: Vec<String>,
        /// Why the removal was scheduled, for logs.
        reason: String,
    },
    /// Reply once every earlier task has been processed.
    Flush(oneshot::Sender<()>),
    /// Stop the worker.
    Shutdown,
}

/// Configuration for the cleanup worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Retry policy for each removal.
    pub retry: RetryConfig,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
        }
    }
}

/// Statistics published by the cleanup worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Removal tasks processed.
    pub tasks_processed: u64,
    /// Paths removed.
    pub paths_removed: u64,
    /// Paths that were already gone.
    pub paths_missing: u64,
    /// Paths that could not be removed.
    pub paths_failed: u64,
    /// Last removal failure, if any.
    pub last_failure: Option<String>,
}

/// Handle for submitting cleanup work and reading stats.
#[derive(Clone)]
pub struct CleanupHandle {
    sender: mpsc::UnboundedSender<CleanupTask>,
    stats: watch::Receiver<CleanupStats>,
}

impl CleanupHandle {
    /// Schedule removal of `paths`. Returns false if the worker has stopped.
    pub fn submit_remove(&self, paths: Vec<String>, reason: impl Into<String>) -> bool {
        if paths.is_empty() {
            return true;
        }
        let reason = reason.into();
        match self.sender.send(CleanupTask::Remove { paths, reason }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(task)) => {
                warn!(?task, "cleanup worker stopped, dropping task");
                false
            }
        }
    }

    /// Wait until every task submitted before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(CleanupTask::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ask the worker to stop after draining earlier tasks.
    pub fn shutdown(&self) {
        let _ = self.sender.send(CleanupTask::Shutdown);
    }

    /// Snapshot of current stats.
    pub fn stats(&self) -> CleanupStats {
        self.stats.borrow().clone()
    }

    /// Check if the worker is still running.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Worker that executes cleanup tasks against a backend.
pub struct CleanupWorker {
    config: CleanupConfig,
    backend: Arc<dyn Backend>,
    stats_tx: watch::Sender<CleanupStats>,
    stats: CleanupStats,
}

impl CleanupWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(config: CleanupConfig, backend: Arc<dyn Backend>) -> CleanupHandle {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(CleanupStats::default());

        let worker = CleanupWorker {
            config,
            backend,
            stats_tx,
            stats: CleanupStats::default(),
        };
        tokio::spawn(worker.run(task_rx));

        CleanupHandle {
            sender: task_tx,
            stats: stats_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CleanupTask>) {
        while let Some(task) = rx.recv().await {
            match task {
                CleanupTask::Remove { paths, reason } => self.remove_all(paths, &reason).await,
                CleanupTask::Flush(done) => {
                    let _ = done.send(());
                }
                CleanupTask::Shutdown => break,
            }
        }
        debug!("cleanup worker stopped");
    }

    async fn remove_all(&mut self, paths: Vec<String>, reason: &str) {
        let removals = paths.iter().map(|p| {
            let backend = self.backend.clone();
            let config = self.config.retry.clone();
            async move {
                let result = retry(&config, "cleanup-remove", || backend.remove(p)).await;
                (p, result)
            }
        });
        let results = futures::future::join_all(removals).await;

        for (p, result) in results {
            match result {
                Ok(()) => self.stats.paths_removed += 1,
                Err(BackendError::NotFound { .. }) => self.stats.paths_missing += 1,
                Err(e) => {
                    warn!(path = %p, reason, error = %e, "cleanup removal failed");
                    self.stats.paths_failed += 1;
                    self.stats.last_failure = Some(format!("{}: {}", p, e));
                }
            }
        }
        self.stats.tasks_processed += 1;
        debug!(reason, paths = paths.len(), "cleanup task done");
        let _ = self.stats_tx.send(self.stats.clone());
    }
}
