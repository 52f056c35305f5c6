//! Backend over a directory of the local filesystem.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::backend::{Backend, BackendError, BackendResult, ByteStream, Entry, ProgressFn};
use crate::path;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Serves the backend namespace from `root` on the local disk.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    max_name_len: Option<usize>,
}

impl LocalBackend {
    /// Backend rooted at `root`, which must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_name_len: None,
        }
    }

    /// Reject names longer than `max` bytes, like a bounded remote would.
    pub fn with_max_name_len(mut self, max: usize) -> Self {
        self.max_name_len = Some(max);
        self
    }

    fn resolve(&self, p: &str) -> (String, PathBuf) {
        let cleaned = path::clean(p);
        let local = self.root.join(cleaned.trim_start_matches('/'));
        (cleaned, local)
    }

    fn check_name(&self, name: &str) -> BackendResult<()> {
        match self.max_name_len {
            Some(max) if name.len() > max => Err(BackendError::NameTooLong {
                name: name.to_string(),
                len: name.len(),
                max,
            }),
            _ => Ok(()),
        }
    }

    async fn entry_for(&self, backend_path: &str, local: &std::path::Path) -> BackendResult<Entry> {
        let meta = fs::metadata(local).await.map_err(|e| map_io(e, backend_path))?;
        Ok(Entry {
            name: path::base_name(backend_path).to_string(),
            path: backend_path.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified()?,
            is_dir: meta.is_dir(),
            thumbnail: None,
        })
    }

    async fn ensure_absent(&self, backend_path: &str, local: &std::path::Path) -> BackendResult<()> {
        if fs::try_exists(local).await? {
            return Err(BackendError::AlreadyExists {
                path: backend_path.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_dir(&self, backend_path: &str, local: &std::path::Path) -> BackendResult<()> {
        let meta = fs::metadata(local).await.map_err(|e| map_io(e, backend_path))?;
        if !meta.is_dir() {
            return Err(BackendError::NotADirectory {
                path: backend_path.to_string(),
            });
        }
        Ok(())
    }
}

fn map_io(err: std::io::Error, p: &str) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound { path: p.to_string() },
        ErrorKind::AlreadyExists => BackendError::AlreadyExists { path: p.to_string() },
        _ => BackendError::Io(err),
    }
}

/// Copy a directory tree without recursion.
async fn copy_tree(from: PathBuf, to: PathBuf) -> std::io::Result<()> {
    let mut pending = vec![(from, to)];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list(&self, p: &str) -> BackendResult<Vec<Entry>> {
        let (dir, local) = self.resolve(p);
        self.ensure_dir(&dir, &local).await?;
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&local).await.map_err(|e| map_io(e, &dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = path::join(&dir, &name);
            out.push(self.entry_for(&child, &entry.path()).await?);
        }
        Ok(out)
    }

    async fn get(&self, p: &str) -> BackendResult<Entry> {
        let (cleaned, local) = self.resolve(p);
        self.entry_for(&cleaned, &local).await
    }

    async fn make_dir(&self, p: &str) -> BackendResult<()> {
        let (cleaned, local) = self.resolve(p);
        self.check_name(path::base_name(&cleaned))?;
        fs::create_dir(&local).await.map_err(|e| map_io(e, &cleaned))
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> BackendResult<()> {
        let (src, src_local) = self.resolve(src);
        let (dst_dir, dst_local) = self.resolve(dst_dir);
        self.ensure_dir(&dst_dir, &dst_local).await?;
        let target = path::join(&dst_dir, path::base_name(&src));
        let (_, target_local) = self.resolve(&target);
        self.ensure_absent(&target, &target_local).await?;
        fs::rename(&src_local, &target_local)
            .await
            .map_err(|e| map_io(e, &src))
    }

    async fn rename(&self, p: &str, new_name: &str) -> BackendResult<()> {
        let (cleaned, local) = self.resolve(p);
        self.check_name(new_name)?;
        let target = path::join(&path::parent(&cleaned), new_name);
        if target == cleaned {
            return Ok(());
        }
        let (_, target_local) = self.resolve(&target);
        self.ensure_absent(&target, &target_local).await?;
        fs::rename(&local, &target_local)
            .await
            .map_err(|e| map_io(e, &cleaned))
    }

    async fn copy_to(&self, src: &str, dst_dir: &str) -> BackendResult<String> {
        let (src, src_local) = self.resolve(src);
        let (dst_dir, dst_local) = self.resolve(dst_dir);
        self.ensure_dir(&dst_dir, &dst_local).await?;
        let target = path::join(&dst_dir, path::base_name(&src));
        let (_, target_local) = self.resolve(&target);
        self.ensure_absent(&target, &target_local).await?;

        let meta = fs::metadata(&src_local).await.map_err(|e| map_io(e, &src))?;
        if meta.is_dir() {
            copy_tree(src_local, target_local).await?;
        } else {
            fs::copy(&src_local, &target_local).await.map_err(|e| map_io(e, &src))?;
        }
        debug!(from = %src, to = %target, "copied");
        Ok(target)
    }

    async fn remove(&self, p: &str) -> BackendResult<()> {
        let (cleaned, local) = self.resolve(p);
        if cleaned == "/" {
            return Err(BackendError::Other {
                reason: "refusing to remove backend root".to_string(),
            });
        }
        let meta = fs::metadata(&local).await.map_err(|e| map_io(e, &cleaned))?;
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        removed.map_err(|e| map_io(e, &cleaned))
    }

    async fn put_stream(
        &self,
        dir: &str,
        name: &str,
        mut body: ByteStream,
        size_hint: u64,
        progress: ProgressFn,
    ) -> BackendResult<()> {
        self.check_name(name)?;
        let (dir, dir_local) = self.resolve(dir);
        self.ensure_dir(&dir, &dir_local).await?;
        let target = path::join(&dir, name);
        let target_local = dir_local.join(name);

        let mut file = fs::File::create(&target_local)
            .await
            .map_err(|e| map_io(e, &target))?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if size_hint > 0 {
                progress((written as f64 / size_hint as f64 * 100.0).min(100.0));
            }
        }
        file.flush().await?;
        progress(100.0);
        debug!(path = %target, bytes = written, "stream stored");
        Ok(())
    }
}
