//! In-memory backend with an optional name length bound and fault injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::backend::{Backend, BackendError, BackendResult, ByteStream, Entry, ProgressFn};
use crate::path;

/// Backend operation kinds, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    List,
    Get,
    MakeDir,
    Move,
    Rename,
    Copy,
    Remove,
    Put,
}

#[derive(Debug, Clone)]
struct Node {
    entry: Entry,
    data: Bytes,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    faults: HashSet<(FaultOp, String)>,
    calls: HashMap<FaultOp, usize>,
}

/// A backend held entirely in memory.
pub struct MemoryBackend {
    max_name_len: Option<usize>,
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Empty backend containing only `/`, with no name length limit.
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(
            "/".to_string(),
            Node {
                entry: Entry::dir("", "/"),
                data: Bytes::new(),
            },
        );
        Self {
            max_name_len: None,
            state: Mutex::new(state),
        }
    }

    /// Empty backend rejecting names longer than `max`.
    pub fn with_max_name_len(max: usize) -> Self {
        Self {
            max_name_len: Some(max),
            ..Self::new()
        }
    }

    /// Make every future `op` on `path` fail.
    pub fn fail_on(&self, op: FaultOp, path: &str) {
        self.state.lock().faults.insert((op, path::clean(path)));
    }

    /// Drop all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Number of times `op` has been invoked, including failed calls.
    pub fn calls(&self, op: FaultOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Sorted names of the entries directly inside `dir`.
    pub fn entry_names(&self, dir: &str) -> Vec<String> {
        let state = self.state.lock();
        children(&state.nodes, &path::clean(dir))
            .map(|n| n.entry.name.clone())
            .collect()
    }

    /// Contents of a file, if present.
    pub fn read(&self, file: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .nodes
            .get(&path::clean(file))
            .filter(|n| !n.entry.is_dir)
            .map(|n| n.data.to_vec())
    }

    /// True if an entry exists at `p`.
    pub fn exists(&self, p: &str) -> bool {
        self.state.lock().nodes.contains_key(&path::clean(p))
    }

    fn begin(&self, op: FaultOp, p: &str) -> BackendResult<String> {
        let cleaned = path::clean(p);
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if state.faults.contains(&(op, cleaned.clone())) {
            debug!(?op, path = %cleaned, "injected fault");
            return Err(BackendError::Other {
                reason: format!("injected {:?} fault on {}", op, cleaned),
            });
        }
        Ok(cleaned)
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
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn children<'a>(nodes: &'a BTreeMap<String, Node>, dir: &str) -> impl Iterator<Item = &'a Node> + 'a {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
    let depth = prefix.matches('/').count();
    nodes
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .filter(move |(k, _)| !k.ends_with('/') && k.matches('/').count() == depth)
        .map(|(_, n)| n)
}

fn require_dir(nodes: &BTreeMap<String, Node>, dir: &str) -> BackendResult<()> {
    match nodes.get(dir) {
        Some(n) if n.entry.is_dir => Ok(()),
        Some(_) => Err(BackendError::NotADirectory { path: dir.to_string() }),
        None => Err(BackendError::NotFound { path: dir.to_string() }),
    }
}

fn subtree_keys(nodes: &BTreeMap<String, Node>, root: &str) -> Vec<String> {
    let prefix = format!("{}/", root);
    nodes
        .keys()
        .filter(|k| *k == root || k.starts_with(&prefix))
        .cloned()
        .collect()
}

/// Copy (or move) the subtree at `from` to `to`.
fn relocate(nodes: &mut BTreeMap<String, Node>, from: &str, to: &str, keep_source: bool) {
    let now = SystemTime::now();
    for key in subtree_keys(nodes, from) {
        let node = if keep_source {
            nodes.get(&key).cloned()
        } else {
            nodes.remove(&key)
        };
        let Some(mut node) = node else { continue };
        let new_key = format!("{}{}", to, &key[from.len()..]);
        node.entry.name = path::base_name(&new_key).to_string();
        node.entry.path = new_key.clone();
        node.entry.modified = now;
        nodes.insert(new_key, node);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list(&self, p: &str) -> BackendResult<Vec<Entry>> {
        let dir = self.begin(FaultOp::List, p)?;
        let state = self.state.lock();
        require_dir(&state.nodes, &dir)?;
        Ok(children(&state.nodes, &dir).map(|n| n.entry.clone()).collect())
    }

    async fn get(&self, p: &str) -> BackendResult<Entry> {
        let p = self.begin(FaultOp::Get, p)?;
        let state = self.state.lock();
        state
            .nodes
            .get(&p)
            .map(|n| n.entry.clone())
            .ok_or(BackendError::NotFound { path: p })
    }

    async fn make_dir(&self, p: &str) -> BackendResult<()> {
        let p = self.begin(FaultOp::MakeDir, p)?;
        let (parent, name) = path::split_target(&p);
        self.check_name(&name)?;
        let mut state = self.state.lock();
        require_dir(&state.nodes, &parent)?;
        if state.nodes.contains_key(&p) {
            return Err(BackendError::AlreadyExists { path: p });
        }
        state.nodes.insert(
            p.clone(),
            Node {
                entry: Entry::dir(name, p),
                data: Bytes::new(),
            },
        );
        Ok(())
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> BackendResult<()> {
        let src = self.begin(FaultOp::Move, src)?;
        let dst_dir = path::clean(dst_dir);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&src) {
            return Err(BackendError::NotFound { path: src });
        }
        require_dir(&state.nodes, &dst_dir)?;
        let target = path::join(&dst_dir, path::base_name(&src));
        if state.nodes.contains_key(&target) {
            return Err(BackendError::AlreadyExists { path: target });
        }
        relocate(&mut state.nodes, &src, &target, false);
        Ok(())
    }

    async fn rename(&self, p: &str, new_name: &str) -> BackendResult<()> {
        let p = self.begin(FaultOp::Rename, p)?;
        self.check_name(new_name)?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&p) {
            return Err(BackendError::NotFound { path: p });
        }
        let target = path::join(&path::parent(&p), new_name);
        if target == p {
            return Ok(());
        }
        if state.nodes.contains_key(&target) {
            return Err(BackendError::AlreadyExists { path: target });
        }
        relocate(&mut state.nodes, &p, &target, false);
        Ok(())
    }

    async fn copy_to(&self, src: &str, dst_dir: &str) -> BackendResult<String> {
        let src = self.begin(FaultOp::Copy, src)?;
        let dst_dir = path::clean(dst_dir);
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&src) {
            return Err(BackendError::NotFound { path: src });
        }
        require_dir(&state.nodes, &dst_dir)?;
        let target = path::join(&dst_dir, path::base_name(&src));
        if state.nodes.contains_key(&target) {
            return Err(BackendError::AlreadyExists { path: target });
        }
        relocate(&mut state.nodes, &src, &target, true);
        Ok(target)
    }

    async fn remove(&self, p: &str) -> BackendResult<()> {
        let p = self.begin(FaultOp::Remove, p)?;
        let mut state = self.state.lock();
        if p == "/" || !state.nodes.contains_key(&p) {
            return Err(BackendError::NotFound { path: p });
        }
        for key in subtree_keys(&state.nodes, &p) {
            state.nodes.remove(&key);
        }
        Ok(())
    }

    async fn put_stream(
        &self,
        dir: &str,
        name: &str,
        mut body: ByteStream,
        size_hint: u64,
        progress: ProgressFn,
    ) -> BackendResult<()> {
        let target = self.begin(FaultOp::Put, &path::join(dir, name))?;
        self.check_name(name)?;
        {
            let state = self.state.lock();
            require_dir(&state.nodes, &path::clean(dir))?;
        }

        let mut data = Vec::with_capacity(size_hint as usize);
        body.read_to_end(&mut data).await?;
        progress(100.0);

        let mut state = self.state.lock();
        if state.nodes.get(&target).is_some_and(|n| n.entry.is_dir) {
            return Err(BackendError::AlreadyExists { path: target });
        }
        let entry = Entry::file(name, target.clone(), data.len() as u64);
        state.nodes.insert(
            target,
            Node {
                entry,
                data: Bytes::from(data),
            },
        );
        Ok(())
    }
}
