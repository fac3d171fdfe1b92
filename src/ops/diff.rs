use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::DiffSource;
use crate::error::{Error, Result};
use crate::fs::{contents_equal, read_symlink_target, scan_tree, FileMetadata, ZFS_CONTROL_DIR};
use crate::graph::Graph;
use crate::id::FilesystemId;
use crate::ops::filesystem::filesystem;
use crate::types::{Change, ChangeKind, Changeset, EntryType};

/// changes of a filesystem against its parent's snapshot
///
/// reads the frozen snapshot once `fs` is frozen, the live tree before that.
pub fn diff_filesystem(graph: &Graph, id: &FilesystemId) -> Result<Changeset> {
    let fs = filesystem(graph, id)?;
    let source = if fs.is_frozen() {
        DiffSource::Snapshot
    } else {
        DiffSource::Live
    };
    let changes = graph.backend().diff(id, fs.parent.as_ref(), source)?;
    debug!(fs = %id, ?source, changes = changes.len(), "diffed filesystem");
    Ok(changes)
}

/// compare two whole trees; `old_root` of `None` is an empty tree
///
/// the roots themselves are never reported, nor is a backend control
/// directory at the root.
pub fn fallback_diff(old_root: Option<&Path>, new_root: &Path) -> Result<Changeset> {
    let old = match old_root {
        Some(root) => scan_tree(root)?,
        None => BTreeMap::new(),
    };
    let new = scan_tree(new_root)?;

    let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut changes = Vec::new();
    for path in paths {
        if path == "/" {
            continue;
        }
        let before = match (old_root, old.get(path)) {
            (Some(root), Some(meta)) => Some((tree_path(root, path), meta)),
            _ => None,
        };
        let after = new.get(path).map(|meta| (tree_path(new_root, path), meta));
        let before = before.as_ref().map(|(p, m)| (p.as_path(), *m));
        let after = after.as_ref().map(|(p, m)| (p.as_path(), *m));
        if let Some(change) = classify(path, before, after)? {
            changes.push(change);
        }
    }
    Ok(Changeset::new(changes))
}

/// classify only the given candidate paths, as reported by a native diff
///
/// the result matches [`fallback_diff`] as long as `candidates` contains
/// every path whose entry changed. directories that appear or disappear
/// are expanded to their whole subtree.
pub fn diff_candidates(
    old_root: &Path,
    new_root: &Path,
    candidates: impl IntoIterator<Item = String>,
) -> Result<Changeset> {
    let mut changes = Vec::new();

    for path in candidates {
        if path == "/" || is_control_path(&path) {
            continue;
        }
        let old_path = tree_path(old_root, &path);
        let new_path = tree_path(new_root, &path);
        let old = lstat(&old_path)?;
        let new = lstat(&new_path)?;

        let before = old.as_ref().map(|m| (old_path.as_path(), m));
        let after = new.as_ref().map(|m| (new_path.as_path(), m));
        if let Some(change) = classify(&path, before, after)? {
            changes.push(change);
        }

        let was_dir = matches!(&old, Some(m) if m.entry == EntryType::Directory);
        let is_dir = matches!(&new, Some(m) if m.entry == EntryType::Directory);
        if was_dir && !is_dir {
            expand_subtree(&old_path, &path, ChangeKind::Deleted, &mut changes)?;
        }
        if is_dir && !was_dir {
            expand_subtree(&new_path, &path, ChangeKind::Added, &mut changes)?;
        }
    }
    Ok(Changeset::new(changes))
}

/// the change, if any, between two states of one path
///
/// entries are equal when type, permission bits, ownership and payload
/// (file bytes, link target or device number) match. directory size and
/// timestamps are ignored.
pub(crate) fn classify(
    path: &str,
    old: Option<(&Path, &FileMetadata)>,
    new: Option<(&Path, &FileMetadata)>,
) -> Result<Option<Change>> {
    let change = |kind: ChangeKind, meta: &FileMetadata| Change {
        path: path.to_string(),
        kind,
        entry: meta.entry,
        size: if kind == ChangeKind::Deleted {
            0
        } else {
            meta.content_size()
        },
    };

    Ok(match (old, new) {
        (None, None) => None,
        (None, Some((_, meta))) => Some(change(ChangeKind::Added, meta)),
        (Some((_, meta)), None) => Some(change(ChangeKind::Deleted, meta)),
        (Some((old_path, old_meta)), Some((new_path, new_meta))) => {
            if entries_differ(old_path, old_meta, new_path, new_meta)? {
                Some(change(ChangeKind::Modified, new_meta))
            } else {
                None
            }
        }
    })
}

fn entries_differ(
    old_path: &Path,
    old: &FileMetadata,
    new_path: &Path,
    new: &FileMetadata,
) -> Result<bool> {
    if old.entry != new.entry || old.uid != new.uid || old.gid != new.gid {
        return Ok(true);
    }
    if new.entry != EntryType::Symlink && old.mode != new.mode {
        return Ok(true);
    }
    Ok(match new.entry {
        EntryType::Regular => old.size != new.size || !contents_equal(old_path, new_path)?,
        EntryType::Symlink => read_symlink_target(old_path)? != read_symlink_target(new_path)?,
        EntryType::BlockDevice | EntryType::CharDevice => old.rdev != new.rdev,
        _ => false,
    })
}

/// report every entry below `dir` (not `dir` itself) as `kind`
fn expand_subtree(dir: &Path, prefix: &str, kind: ChangeKind, changes: &mut Vec<Change>) -> Result<()> {
    for (rel, meta) in scan_tree(dir)? {
        if rel == "/" {
            continue;
        }
        let path = format!("{}{}", prefix, rel);
        let size = if kind == ChangeKind::Deleted {
            0
        } else {
            meta.content_size()
        };
        changes.push(Change {
            path,
            kind,
            entry: meta.entry,
            size,
        });
    }
    Ok(())
}

/// on-disk location of in-tree `path` below `root`
pub(crate) fn tree_path(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

fn is_control_path(path: &str) -> bool {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    first == ZFS_CONTROL_DIR
}

/// metadata of `path`, `None` when it (or an ancestor) is gone
fn lstat(path: &Path) -> Result<Option<FileMetadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(FileMetadata::from_std_metadata(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(nix::libc::ENOTDIR) => Ok(None),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
