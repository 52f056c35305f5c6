//! Logical objects and the grouping of raw directory entries into them.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::Entry;
use crate::codec::{self, DecodeError, GroupKey, SplitName};
use crate::path;

/// Where a logical object lives on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// The synthetic root directory; it has no segments of its own.
    Root {
        /// Backend directory the logical namespace is rooted at.
        remote_path: String,
    },
    /// Physical segment paths ordered by split index. Index 0 carries the
    /// content and metadata, the rest are placeholders.
    Segments(Vec<String>),
}

/// A user-facing file or directory bound to its physical segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalObject {
    name: String,
    path: String,
    entry: Entry,
    placement: Placement,
}

impl LogicalObject {
    /// The synthetic root directory.
    pub fn root(remote_path: impl Into<String>) -> Self {
        Self {
            name: "Root".to_string(),
            path: "/".to_string(),
            entry: Entry::dir("Root", "/"),
            placement: Placement::Root {
                remote_path: remote_path.into(),
            },
        }
    }

    /// An object backed by `segments`, described by the authoritative `entry`.
    pub fn with_segments(name: impl Into<String>, logical_path: impl Into<String>, entry: Entry, segments: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path: logical_path.into(),
            entry,
            placement: Placement::Segments(segments),
        }
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Metadata of the authoritative segment.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn is_dir(&self) -> bool {
        self.entry.is_dir
    }

    pub fn size(&self) -> u64 {
        self.entry.size
    }

    pub fn modified(&self) -> SystemTime {
        self.entry.modified
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.entry.thumbnail.as_deref()
    }

    pub(crate) fn set_thumbnail(&mut self, url: String) {
        self.entry.thumbnail = Some(url);
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn is_root(&self) -> bool {
        matches!(self.placement, Placement::Root { .. })
    }

    /// Physical segment paths; empty for the root.
    pub fn segment_paths(&self) -> &[String] {
        match &self.placement {
            Placement::Root { .. } => &[],
            Placement::Segments(paths) => paths,
        }
    }

    /// Backend path of the authoritative segment, or the remote root.
    pub fn primary_path(&self) -> &str {
        match &self.placement {
            Placement::Root { remote_path } => remote_path,
            Placement::Segments(paths) => paths.first().map(String::as_str).unwrap_or_default(),
        }
    }

    /// Backend directory holding this object's segments.
    pub fn physical_parent(&self) -> Option<String> {
        match &self.placement {
            Placement::Root { .. } => None,
            Placement::Segments(paths) => paths.first().map(|p| path::parent(p)),
        }
    }
}

/// Group raw entries of one physical directory into logical objects.
///
/// Simple entries map one-to-one. Split entries are bucketed by group key and
/// a bucket becomes an object only if it decodes; incomplete or corrupt
/// buckets are logged and dropped. Output is sorted by logical name.
pub fn group_entries(logical_dir: &str, entries: Vec<Entry>) -> Vec<LogicalObject> {
    let mut objects = Vec::new();
    let mut groups: BTreeMap<GroupKey, Vec<(SplitName, Entry)>> = BTreeMap::new();

    for entry in entries {
        if codec::is_split_name(&entry.name) {
            match entry.name.parse::<SplitName>() {
                Ok(split) => groups.entry(split.group_key()).or_default().push((split, entry)),
                Err(e) => warn!(name = %entry.name, error = %e, "skipping unparsable split entry"),
            }
            continue;
        }

        match codec::decode_str(&[entry.name.as_str()]) {
            Ok(name) => {
                let segments = vec![entry.path.clone()];
                objects.push(LogicalObject::with_segments(
                    name.clone(),
                    path::join(logical_dir, &name),
                    entry,
                    segments,
                ));
            }
            Err(e) => debug!(name = %entry.name, error = %e, "skipping foreign entry"),
        }
    }

    for (key, mut members) in groups {
        members.sort_by_key(|(split, _)| split.split_index);
        let parts: Vec<SplitName> = members.iter().map(|(s, _)| s.clone()).collect();

        let name = match codec::decode_split(parts).and_then(|bytes| String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)) {
            Ok(name) => name,
            Err(e @ DecodeError::HashMismatch { .. }) => {
                warn!(group = %key, error = %e, "dropping split group, possible hash clash");
                continue;
            }
            Err(e) => {
                warn!(group = %key, members = members.len(), error = %e, "dropping incomplete or corrupt split group");
                continue;
            }
        };

        let segments: Vec<String> = members.iter().map(|(_, e)| e.path.clone()).collect();
        let Some((_, authoritative)) = members.into_iter().next() else {
            continue;
        };
        objects.push(LogicalObject::with_segments(
            name.clone(),
            path::join(logical_dir, &name),
            authoritative,
            segments,
        ));
    }

    objects.sort_by(|a, b| a.name.cmp(&b.name));
    objects
}
