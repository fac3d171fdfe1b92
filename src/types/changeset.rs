use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// kind of change to a path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// one-letter marker, as printed by `diff`
    pub fn marker(&self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
        }
    }
}

/// type of the filesystem entry a change refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// a single path-level change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// absolute path inside the filesystem, e.g. `/etc/passwd`
    pub path: String,
    pub kind: ChangeKind,
    /// type of the entry after the change (before it, for deletions)
    pub entry: EntryType,
    /// size in bytes of a regular file after the change, 0 otherwise
    pub size: u64,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.marker(), self.path)
    }
}

/// path-ordered set of changes between a filesystem and its parent snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    /// build from changes in any order; a later change to the same path wins
    pub fn new(changes: impl IntoIterator<Item = Change>) -> Self {
        let by_path: BTreeMap<String, Change> = changes
            .into_iter()
            .map(|c| (c.path.clone(), c))
            .collect();
        Self {
            changes: by_path.into_values().collect(),
        }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn get(&self, path: &str) -> Option<&Change> {
        self.changes
            .binary_search_by(|c| c.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.changes[i])
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// sum of the sizes of added and modified regular files
    pub fn size_bytes(&self) -> u64 {
        self.changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Deleted && c.entry == EntryType::Regular)
            .map(|c| c.size)
            .sum()
    }

    /// true if `path` or one of its ancestors is deleted in this changeset
    pub fn has_deleted_ancestor(&self, path: &str) -> bool {
        let mut current = path;
        while let Some((parent, _)) = current.rsplit_once('/') {
            if parent.is_empty() {
                break;
            }
            if matches!(self.get(parent), Some(c) if c.kind == ChangeKind::Deleted) {
                return true;
            }
            current = parent;
        }
        false
    }
}

/// join a changeset path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
