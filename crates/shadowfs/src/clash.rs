//! Per-directory clash index allocation.
//!
//! A directory's counter is persisted as a single marker entry named
//! `<prefix><value>`. Advancing the counter writes the next marker and then
//! schedules removal of the previous one, so a crash leaves at most a few
//! stale markers, which the next initialization removes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{byte_stream, no_progress, Backend, BackendError};
use crate::background::CleanupHandle;
use crate::error::Result;
use crate::path;

/// Payload written into every marker entry.
pub const INDEX_CONTENT_MAGIC: &[u8] = b"nindex";

/// Monotonic counter for one directory.
pub struct ClashIndexAllocator {
    backend: Arc<dyn Backend>,
    cleanup: CleanupHandle,
    dir: String,
    prefix: String,
    counter: AtomicU64,
    /// Highest value whose marker is known to be on the backend.
    written: Mutex<Option<u64>>,
}

impl ClashIndexAllocator {
    /// Load the counter for `dir`, creating the directory if needed, and
    /// schedule removal of every marker except the highest.
    pub async fn initialize(
        backend: Arc<dyn Backend>,
        cleanup: CleanupHandle,
        dir: &str,
        prefix: &str,
    ) -> Result<Self> {
        let dir = path::clean(dir);
        if backend.get(&dir).await.is_err() {
            match backend.make_dir(&dir).await {
                Ok(()) | Err(BackendError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let markers: Vec<(u64, String)> = backend
            .list(&dir)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let suffix = entry.name.strip_prefix(prefix)?;
                match suffix.parse::<u64>() {
                    Ok(value) if suffix.bytes().all(|b| b.is_ascii_digit()) => Some((value, entry.path)),
                    _ => {
                        warn!(name = %entry.name, "ignoring marker with non-numeric suffix");
                        None
                    }
                }
            })
            .collect();

        let highest = markers.iter().map(|(v, _)| *v).max();
        let current = highest.unwrap_or(0);
        let stale: Vec<String> = markers
            .into_iter()
            .filter(|(v, _)| *v != current)
            .map(|(_, p)| p)
            .collect();
        if !stale.is_empty() {
            info!(dir = %dir, count = stale.len(), "removing stale clash markers");
            cleanup.submit_remove(stale, "stale clash markers");
        }

        debug!(dir = %dir, current, "clash index loaded");
        Ok(Self {
            backend,
            cleanup,
            dir,
            prefix: prefix.to_string(),
            counter: AtomicU64::new(current),
            written: Mutex::new(highest),
        })
    }

    /// Directory this allocator owns.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Last value handed out (or loaded).
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn marker_name(&self, value: u64) -> String {
        format!("{}{}", self.prefix, value)
    }

    /// Allocate the next value and persist it as the directory's marker.
    ///
    /// Concurrent callers get distinct, increasing values. A value is consumed
    /// even if writing its marker fails; the marker superseded is always the
    /// last one actually written.
    pub async fn next(&self) -> Result<u64> {
        let value = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = self.marker_name(value);

        self.backend
            .put_stream(
                &self.dir,
                &name,
                byte_stream(INDEX_CONTENT_MAGIC),
                INDEX_CONTENT_MAGIC.len() as u64,
                no_progress(),
            )
            .await?;

        // a concurrent caller may already have written a higher marker
        let superseded = {
            let mut written = self.written.lock();
            match *written {
                Some(last) if last > value => Some(value),
                _ => written.replace(value),
            }
        };
        if let Some(stale) = superseded {
            let stale = path::join(&self.dir, &self.marker_name(stale));
            self.cleanup.submit_remove(vec![stale], "superseded clash marker");
        }
        debug!(dir = %self.dir, value, "clash index advanced");
        Ok(value)
    }
}

/// Caches one allocator per directory, initializing on first use.
pub struct ClashIndexRegistry {
    backend: Arc<dyn Backend>,
    cleanup: CleanupHandle,
    prefix: String,
    allocators: DashMap<String, Arc<ClashIndexAllocator>>,
}

impl ClashIndexRegistry {
    /// Create an empty registry.
    pub fn new(backend: Arc<dyn Backend>, cleanup: CleanupHandle, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            cleanup,
            prefix: prefix.into(),
            allocators: DashMap::new(),
        }
    }

    /// Allocator for `dir`.
    pub async fn allocator(&self, dir: &str) -> Result<Arc<ClashIndexAllocator>> {
        let dir = path::clean(dir);
        if let Some(existing) = self.allocators.get(&dir) {
            return Ok(existing.clone());
        }
        let fresh = ClashIndexAllocator::initialize(self.backend.clone(), self.cleanup.clone(), &dir, &self.prefix).await?;
        // a concurrent initializer may have won; keep whichever landed first
        let entry = self.allocators.entry(dir).or_insert_with(|| Arc::new(fresh));
        Ok(entry.value().clone())
    }

    /// Number of cached allocators.
    pub fn len(&self) -> usize {
        self.allocators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{CleanupConfig, CleanupWorker};
    use crate::memory::{FaultOp, MemoryBackend};
    use crate::retry::RetryConfig;

    const PREFIX: &str = ".sd_nindex_";

    fn setup() -> (Arc<MemoryBackend>, CleanupHandle) {
        let backend = Arc::new(MemoryBackend::new());
        let cleanup = CleanupWorker::start(
            CleanupConfig {
                retry: RetryConfig::none(),
            },
            backend.clone(),
        );
        (backend, cleanup)
    }

    async fn marker(backend: &MemoryBackend, dir: &str, value: u64) {
        backend
            .put_stream(dir, &format!("{}{}", PREFIX, value), byte_stream(INDEX_CONTENT_MAGIC), 6, no_progress())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initialize_creates_missing_dir() {
        let (backend, cleanup) = setup();
        let alloc = ClashIndexAllocator::initialize(backend.clone(), cleanup, "/idx", PREFIX)
            .await
            .unwrap();
        assert_eq!(alloc.current(), 0);
        assert!(backend.exists("/idx"));
    }

    #[tokio::test]
    async fn test_initialize_keeps_highest_marker() {
        let (backend, cleanup) = setup();
        backend.make_dir("/idx").await.unwrap();
        for v in [3, 7, 5] {
            marker(&backend, "/idx", v).await;
        }
        marker(&backend, "/idx", 1).await;
        backend
            .put_stream("/idx", "unrelated", byte_stream(b"x".to_vec()), 1, no_progress())
            .await
            .unwrap();

        let alloc = ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
            .await
            .unwrap();
        assert_eq!(alloc.current(), 7);
        cleanup.flush().await;
        assert_eq!(backend.entry_names("/idx"), vec![format!("{}7", PREFIX), "unrelated".to_string()]);
    }

    #[tokio::test]
    async fn test_next_is_monotonic_and_leaves_one_marker() {
        let (backend, cleanup) = setup();
        backend.make_dir("/idx").await.unwrap();
        marker(&backend, "/idx", 4).await;
        let alloc = ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
            .await
            .unwrap();

        let mut last = alloc.current();
        for _ in 0..5 {
            let v = alloc.next().await.unwrap();
            assert!(v > last);
            last = v;
            cleanup.flush().await;
            assert_eq!(backend.entry_names("/idx"), vec![format!("{}{}", PREFIX, v)]);
        }
        assert_eq!(last, 9);
        assert_eq!(backend.read(&format!("/idx/{}9", PREFIX)).unwrap(), INDEX_CONTENT_MAGIC);
    }

    #[tokio::test]
    async fn test_concurrent_next_values_are_distinct() {
        let (backend, cleanup) = setup();
        let alloc = Arc::new(
            ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
                .await
                .unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                tokio::spawn(async move { alloc.next().await.unwrap() })
            })
            .collect();
        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap());
        }
        values.sort();
        assert_eq!(values, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_failed_marker_write_is_reported() {
        let (backend, cleanup) = setup();
        let alloc = ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
            .await
            .unwrap();
        assert_eq!(alloc.next().await.unwrap(), 1);
        backend.fail_on(FaultOp::Put, &format!("/idx/{}2", PREFIX));
        assert!(alloc.next().await.is_err());
        assert_eq!(alloc.next().await.unwrap(), 3);

        cleanup.flush().await;
        assert_eq!(backend.entry_names("/idx"), vec![format!("{}3", PREFIX)]);
    }

    #[tokio::test]
    async fn test_zero_marker_is_superseded() {
        let (backend, cleanup) = setup();
        backend.make_dir("/idx").await.unwrap();
        marker(&backend, "/idx", 0).await;
        let alloc = ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
            .await
            .unwrap();
        assert_eq!(alloc.current(), 0);

        assert_eq!(alloc.next().await.unwrap(), 1);
        cleanup.flush().await;
        assert_eq!(backend.entry_names("/idx"), vec![format!("{}1", PREFIX)]);
    }

    #[tokio::test]
    async fn test_concurrent_next_leaves_one_marker() {
        let (backend, cleanup) = setup();
        let alloc = Arc::new(
            ClashIndexAllocator::initialize(backend.clone(), cleanup.clone(), "/idx", PREFIX)
                .await
                .unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                tokio::spawn(async move { alloc.next().await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        cleanup.flush().await;
        assert_eq!(backend.entry_names("/idx"), vec![format!("{}8", PREFIX)]);
    }

    #[tokio::test]
    async fn test_registry_caches_per_directory() {
        let (backend, cleanup) = setup();
        let registry = ClashIndexRegistry::new(backend.clone(), cleanup, PREFIX);
        let a = registry.allocator("/a").await.unwrap();
        let a2 = registry.allocator("/a/").await.unwrap();
        let b = registry.allocator("/b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);

        assert_eq!(a.next().await.unwrap(), 1);
        assert_eq!(b.next().await.unwrap(), 1);
        assert_eq!(a2.next().await.unwrap(), 2);
    }
}
