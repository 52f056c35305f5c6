//! The shadow filesystem: logical operations fanned out over name segments.
//!
//! Every logical object occupies one or more physical entries in the same
//! backend directory. Segment 0 holds the real content or directory; the
//! others are small placeholder files that reserve the remaining name shards.
//! Mutations run one backend call per segment concurrently and always wait
//! for all of them. Creates (`make_dir`, `put`, `copy_to`) roll back what
//! they started when any segment fails; the rollback runs on the cleanup
//! worker and is never awaited by the caller.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{byte_stream, no_progress, Backend, BackendError, BackendResult, ByteStream, ProgressFn};
use crate::background::{CleanupHandle, CleanupWorker};
use crate::clash::ClashIndexRegistry;
use crate::codec;
use crate::config::ShadowConfig;
use crate::error::{Result, SegmentOp, ShadowError};
use crate::fanout::{FanoutExecutor, FanoutSummary, SegmentTask};
use crate::object::{group_entries, LogicalObject};
use crate::path;

/// Content of placeholder segments.
pub const PLACEHOLDER_CONTENT: &[u8] = b"_sd_";

/// Produces fetchable URLs for thumbnail paths (signing, host prefix, ...).
pub trait ThumbnailSigner: Send + Sync {
    /// URL for the logical path of a thumbnail file.
    fn thumbnail_url(&self, logical_path: &str) -> String;
}

/// Long-name filesystem over a length-bounded backend.
pub struct ShadowFs {
    config: ShadowConfig,
    backend: Arc<dyn Backend>,
    fanout: FanoutExecutor,
    cleanup: CleanupHandle,
    thumbnails: Option<Arc<dyn ThumbnailSigner>>,
}

impl ShadowFs {
    /// Validate `config` and start the cleanup worker on the current runtime.
    pub fn new(config: ShadowConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let cleanup = CleanupWorker::start(config.cleanup.clone(), backend.clone());
        info!(
            remote = %config.remote_path,
            max_filename_len = config.max_filename_len,
            "shadowfs ready"
        );
        Ok(Self {
            fanout: FanoutExecutor::new(config.fanout.clone()),
            config,
            backend,
            cleanup,
            thumbnails: None,
        })
    }

    /// Use `signer` to turn thumbnail paths into URLs in listings.
    pub fn with_thumbnail_signer(mut self, signer: Arc<dyn ThumbnailSigner>) -> Self {
        self.thumbnails = Some(signer);
        self
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Handle to the compensation worker (stats, flush).
    pub fn cleanup(&self) -> &CleanupHandle {
        &self.cleanup
    }

    /// A new clash index registry bound to this backend; callers keep it.
    pub fn clash_registry(&self) -> ClashIndexRegistry {
        ClashIndexRegistry::new(
            self.backend.clone(),
            self.cleanup.clone(),
            self.config.clash_marker_prefix.clone(),
        )
    }

    /// The synthetic root directory.
    pub fn root(&self) -> LogicalObject {
        LogicalObject::root(path::clean(&self.config.remote_path))
    }

    fn encode(&self, name: &str) -> Result<Vec<String>> {
        if name.is_empty() || name.contains('/') {
            return Err(ShadowError::InvalidPath { path: name.to_string() });
        }
        Ok(codec::encode(name, self.config.max_filename_len, 0)?)
    }

    /// Backend directory for a logical directory path.
    fn remote_dir(&self, logical_dir: &str) -> Result<String> {
        let encoded = path::encode_path(&path::clean(logical_dir), self.config.max_filename_len)?;
        Ok(path::clean(&format!("{}/{}", self.config.remote_path, encoded)))
    }

    fn require_dir(&self, dir: &LogicalObject) -> Result<String> {
        if !dir.is_dir() {
            return Err(ShadowError::NotADirectory {
                path: dir.path().to_string(),
            });
        }
        Ok(dir.primary_path().to_string())
    }

    fn require_segments<'a>(&self, obj: &'a LogicalObject, op: SegmentOp) -> Result<&'a [String]> {
        if obj.is_root() {
            return Err(ShadowError::RootNotMutable { op });
        }
        Ok(obj.segment_paths())
    }

    fn task<F, Fut>(&self, index: usize, op: SegmentOp, target: String, call: F) -> SegmentTask
    where
        F: Fn(Arc<dyn Backend>) -> Fut + Send + 'static,
        Fut: Future<Output = BackendResult<()>> + Send + 'static,
    {
        let backend = self.backend.clone();
        SegmentTask::new(index, op, target, move || call(backend.clone()).boxed())
    }

    fn placeholder_task(&self, index: usize, dir: &str, name: &str) -> SegmentTask {
        let dir = dir.to_string();
        let name = name.to_string();
        self.task(index, SegmentOp::Placeholder, path::join(&dir, &name), move |b| {
            let dir = dir.clone();
            let name = name.clone();
            async move {
                b.put_stream(
                    &dir,
                    &name,
                    byte_stream(PLACEHOLDER_CONTENT),
                    PLACEHOLDER_CONTENT.len() as u64,
                    no_progress(),
                )
                .await
            }
        })
    }

    /// On failure, hand every path the fan-out may have created to the
    /// cleanup worker, then report.
    fn finish_create(&self, summary: FanoutSummary, what: &str) -> Result<()> {
        if !summary.all_succeeded() {
            let paths = summary.compensation_paths();
            warn!(
                op = %summary.op,
                failed = summary.failed(),
                skipped = summary.skipped(),
                rollback = paths.len(),
                object = what,
                "create failed, scheduling rollback"
            );
            self.cleanup.submit_remove(paths, format!("rollback {} {}", summary.op, what));
        }
        summary.into_result()
    }

    /// Look up one logical path.
    ///
    /// Segment names are derived with clash index 0; only the authoritative
    /// segment is fetched.
    pub async fn get(&self, logical_path: &str) -> Result<LogicalObject> {
        if path::is_root(logical_path) {
            return Ok(self.root());
        }
        let (dir, name) = path::split_target(logical_path);
        let remote_dir = self.remote_dir(&dir)?;
        let segments: Vec<String> = self
            .encode(&name)?
            .iter()
            .map(|n| path::join(&remote_dir, n))
            .collect();

        let entry = self.backend.get(&segments[0]).await?;
        debug!(path = %logical_path, segments = segments.len(), "resolved");
        Ok(LogicalObject::with_segments(
            name.clone(),
            path::join(&dir, &name),
            entry,
            segments,
        ))
    }

    /// List a logical directory.
    pub async fn list(&self, dir: &LogicalObject) -> Result<Vec<LogicalObject>> {
        let remote = self.require_dir(dir)?;
        let entries = self.backend.list(&remote).await?;
        let raw = entries.len();
        let mut objects = group_entries(dir.path(), entries);

        if !self.config.show_hidden {
            objects.retain(|o| !o.name().starts_with(&self.config.hidden_prefix));
        }

        if self.config.thumbnail {
            for obj in objects.iter_mut().filter(|o| !o.is_dir() && o.thumbnail().is_none()) {
                let thumb_path = path::join(
                    &path::join(dir.path(), &self.config.thumbnail_dir),
                    &format!("{}.{}", obj.name(), self.config.thumbnail_ext),
                );
                let url = match &self.thumbnails {
                    Some(signer) => signer.thumbnail_url(&thumb_path),
                    None => thumb_path,
                };
                obj.set_thumbnail(url);
            }
        }

        debug!(dir = %dir.path(), raw, listed = objects.len(), "listed");
        Ok(objects)
    }

    /// Resolve then list a logical directory path.
    pub async fn list_path(&self, logical_dir: &str) -> Result<Vec<LogicalObject>> {
        let dir = self.get(logical_dir).await?;
        self.list(&dir).await
    }

    /// Create directory `name` inside `parent`.
    pub async fn make_dir(&self, parent: &LogicalObject, name: &str, cancel: &CancellationToken) -> Result<()> {
        let dir = self.require_dir(parent)?;
        let names = self.encode(name)?;

        let tasks = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                if i == 0 {
                    let target = path::join(&dir, n);
                    let t = target.clone();
                    self.task(i, SegmentOp::MakeDir, target, move |b| {
                        let t = t.clone();
                        async move { b.make_dir(&t).await }
                    })
                } else {
                    self.placeholder_task(i, &dir, n)
                }
            })
            .collect();

        let summary = self.fanout.run(SegmentOp::MakeDir, tasks, cancel).await;
        self.finish_create(summary, &path::join(parent.path(), name))
    }

    /// Upload `body` as file `name` inside `dst_dir`.
    ///
    /// The stream goes to segment 0 and is not retried once consumed.
    pub async fn put(
        &self,
        dst_dir: &LogicalObject,
        name: &str,
        body: ByteStream,
        size: u64,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dir = self.require_dir(dst_dir)?;
        let names = self.encode(name)?;

        let mut body = Some(body);
        let mut tasks = Vec::with_capacity(names.len());
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                tasks.push(self.placeholder_task(i, &dir, n));
                continue;
            }
            let mut stream = body.take();
            let backend = self.backend.clone();
            let progress = progress.clone();
            let (d, seg) = (dir.clone(), n.clone());
            tasks.push(SegmentTask::new(i, SegmentOp::Put, path::join(&dir, n), move || {
                let stream = stream.take();
                let backend = backend.clone();
                let progress = progress.clone();
                let (d, seg) = (d.clone(), seg.clone());
                async move {
                    match stream {
                        Some(stream) => backend.put_stream(&d, &seg, stream, size, progress).await,
                        None => Err(BackendError::StreamConsumed { name: seg }),
                    }
                }
                .boxed()
            }));
        }

        let summary = self.fanout.run(SegmentOp::Put, tasks, cancel).await;
        self.finish_create(summary, &path::join(dst_dir.path(), name))
    }

    /// Upload an in-memory payload.
    pub async fn put_bytes(
        &self,
        dst_dir: &LogicalObject,
        name: &str,
        data: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = data.into();
        let size = data.len() as u64;
        self.put(dst_dir, name, byte_stream(data), size, no_progress(), cancel)
            .await
    }

    /// Move every segment of `src` into `dst_dir`.
    ///
    /// A partial move is not undone: moved segments stay at the destination.
    pub async fn move_to(&self, src: &LogicalObject, dst_dir: &LogicalObject, cancel: &CancellationToken) -> Result<()> {
        let segments = self.require_segments(src, SegmentOp::Move)?;
        let dst = self.require_dir(dst_dir)?;

        let tasks = segments
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let (p, dst) = (p.clone(), dst.clone());
                self.task(i, SegmentOp::Move, p.clone(), move |b| {
                    let (p, dst) = (p.clone(), dst.clone());
                    async move { b.move_to(&p, &dst).await }
                })
            })
            .collect();

        let summary = self.fanout.run(SegmentOp::Move, tasks, cancel).await;
        if !summary.all_succeeded() {
            warn!(src = %src.path(), dst = %dst_dir.path(), failed = summary.failed(), "partial move left in place");
        }
        summary.into_result()
    }

    /// Copy every segment of `src` into `dst_dir`, removing the copies on failure.
    pub async fn copy_to(&self, src: &LogicalObject, dst_dir: &LogicalObject, cancel: &CancellationToken) -> Result<()> {
        let segments = self.require_segments(src, SegmentOp::Copy)?;
        let dst = self.require_dir(dst_dir)?;

        let tasks = segments
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let target = path::join(&dst, path::base_name(p));
                let (p, dst) = (p.clone(), dst.clone());
                self.task(i, SegmentOp::Copy, target, move |b| {
                    let (p, dst) = (p.clone(), dst.clone());
                    async move { b.copy_to(&p, &dst).await.map(|_| ()) }
                })
            })
            .collect();

        let summary = self.fanout.run(SegmentOp::Copy, tasks, cancel).await;
        self.finish_create(summary, &path::join(dst_dir.path(), src.name()))
    }

    /// Rename `src` in place.
    ///
    /// Segment `i` of the old name is renamed to segment `i` of the new one.
    /// Extra new segments become placeholders; surplus old segments are
    /// removed. Nothing is rolled back on partial failure.
    pub async fn rename(&self, src: &LogicalObject, new_name: &str, cancel: &CancellationToken) -> Result<()> {
        let old = self.require_segments(src, SegmentOp::Rename)?;
        let new = self.encode(new_name)?;
        let parent = src.physical_parent().ok_or_else(|| ShadowError::InvalidPath {
            path: src.path().to_string(),
        })?;

        let mut tasks = Vec::with_capacity(old.len().max(new.len()));
        for i in 0..old.len().max(new.len()) {
            let task = match (old.get(i), new.get(i)) {
                (Some(from), Some(to)) => {
                    let (from, to) = (from.clone(), to.clone());
                    self.task(i, SegmentOp::Rename, from.clone(), move |b| {
                        let (from, to) = (from.clone(), to.clone());
                        async move { b.rename(&from, &to).await }
                    })
                }
                (None, Some(to)) => self.placeholder_task(i, &parent, to),
                (Some(from), None) => {
                    let from = from.clone();
                    self.task(i, SegmentOp::Remove, from.clone(), move |b| {
                        let from = from.clone();
                        async move { b.remove(&from).await }
                    })
                }
                (None, None) => continue,
            };
            tasks.push(task);
        }

        debug!(src = %src.path(), new_name, old_segments = old.len(), new_segments = new.len(), "rename");
        self.fanout.run(SegmentOp::Rename, tasks, cancel).await.into_result()
    }

    /// Remove every segment of `obj`.
    pub async fn remove(&self, obj: &LogicalObject, cancel: &CancellationToken) -> Result<()> {
        let segments = self.require_segments(obj, SegmentOp::Remove)?;

        let tasks = segments
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let p = p.clone();
                self.task(i, SegmentOp::Remove, p.clone(), move |b| {
                    let p = p.clone();
                    async move { b.remove(&p).await }
                })
            })
            .collect();

        self.fanout.run(SegmentOp::Remove, tasks, cancel).await.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::retry::RetryConfig;

    fn setup() -> (Arc<MemoryBackend>, ShadowFs) {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = ShadowConfig::new("/");
        config.max_filename_len = 60;
        config.fanout.retry = RetryConfig::none();
        config.cleanup.retry = RetryConfig::none();
        let fs = ShadowFs::new(config, backend.clone()).unwrap();
        (backend, fs)
    }

    #[tokio::test]
    async fn test_get_root() {
        let (_, fs) = setup();
        let root = fs.get("/").await.unwrap();
        assert!(root.is_root());
        assert_eq!(root.primary_path(), "/");
        assert!(fs.get("").await.unwrap().is_root());
    }

    #[tokio::test]
    async fn test_get_missing_is_backend_error() {
        let (_, fs) = setup();
        let err = fs.get("/nope").await.unwrap_err();
        assert!(matches!(err, ShadowError::Backend(BackendError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = ShadowConfig::default();
        config.max_filename_len = 5;
        assert!(matches!(ShadowFs::new(config, backend), Err(ShadowError::Config { .. })));
    }

    #[tokio::test]
    async fn test_root_is_not_mutable() {
        let (_, fs) = setup();
        let root = fs.root();
        let cancel = CancellationToken::new();
        assert!(matches!(
            fs.remove(&root, &cancel).await,
            Err(ShadowError::RootNotMutable { op: SegmentOp::Remove })
        ));
        assert!(matches!(
            fs.rename(&root, "x", &cancel).await,
            Err(ShadowError::RootNotMutable { op: SegmentOp::Rename })
        ));
        assert!(matches!(
            fs.copy_to(&root, &root, &cancel).await,
            Err(ShadowError::RootNotMutable { op: SegmentOp::Copy })
        ));
    }

    #[tokio::test]
    async fn test_create_in_file_is_rejected() {
        let (backend, fs) = setup();
        let cancel = CancellationToken::new();
        fs.put_bytes(&fs.root(), "f", b"data".to_vec(), &cancel).await.unwrap();
        let file = fs.get("/f").await.unwrap();
        let err = fs.make_dir(&file, "sub", &cancel).await.unwrap_err();
        assert!(matches!(err, ShadowError::NotADirectory { .. }));
        assert_eq!(backend.calls(crate::memory::FaultOp::MakeDir), 0);
    }

    #[tokio::test]
    async fn test_names_with_separators_are_rejected() {
        let (_, fs) = setup();
        let cancel = CancellationToken::new();
        let err = fs.make_dir(&fs.root(), "a/b", &cancel).await.unwrap_err();
        assert!(matches!(err, ShadowError::InvalidPath { .. }));
        let err = fs.put_bytes(&fs.root(), "", b"".to_vec(), &cancel).await.unwrap_err();
        assert!(matches!(err, ShadowError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_long_name_too_many_segments() {
        let (_, fs) = setup();
        let cancel = CancellationToken::new();
        // 33 payload chars per segment, 255 segments max
        let name = "n".repeat(7000);
        let err = fs.make_dir(&fs.root(), &name, &cancel).await.unwrap_err();
        assert!(matches!(err, ShadowError::Encode(_)));
    }
}
