use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::backend::{Capabilities, DiffSource, GraphBackend};
use crate::config::BackendKind;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{copy_tree, remove_path};
use crate::id::FilesystemId;
use crate::types::{Changeset, SnapshotRef};

const SNAPSHOT_SUFFIX: &str = "snap";
const CLONE_SUFFIX: &str = "origin";

/// backend over plain directories
///
/// a clone is a full copy of the parent's snapshot and freeze copies the
/// live tree aside. works on any filesystem, at the cost of space and time.
pub struct DirBackend {
    base: PathBuf,
}

impl DirBackend {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn live(&self, id: &FilesystemId) -> PathBuf {
        self.base.join(id.as_str())
    }

    fn snapshot(&self, id: &FilesystemId) -> PathBuf {
        self.base.join(format!("{}.{}", id, SNAPSHOT_SUFFIX))
    }

    /// marker naming the filesystem a store was cloned from
    fn origin_marker(&self, id: &FilesystemId) -> PathBuf {
        self.base.join(format!("{}.{}", id, CLONE_SUFFIX))
    }

    /// ids of stores cloned from `id`'s snapshot
    fn clones_of(&self, id: &FilesystemId) -> Result<Vec<String>> {
        let mut clones = Vec::new();
        let suffix = format!(".{}", CLONE_SUFFIX);
        for entry in fs::read_dir(&self.base).with_path(&self.base)? {
            let entry = entry.with_path(&self.base)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(child) = name.strip_suffix(&suffix) else {
                continue;
            };
            let origin = fs::read_to_string(entry.path()).with_path(entry.path())?;
            if origin.trim() == id.as_str() {
                clones.push(child.to_string());
            }
        }
        Ok(clones)
    }
}

impl GraphBackend for DirBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dir
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.base).with_path(&self.base)
    }

    fn validate(&self) -> Result<()> {
        if !self.base.is_dir() {
            return Err(Error::BackendUnavailable(format!(
                "{} is not a directory",
                self.base.display()
            )));
        }
        Ok(())
    }

    fn create(&self, id: &FilesystemId, parent: Option<&FilesystemId>) -> Result<String> {
        let live = self.live(id);
        if live.exists() {
            return Err(Error::backend("create", id.as_str(), "already exists"));
        }
        match parent {
            Some(parent) => {
                let snap = self.snapshot(parent);
                if !snap.is_dir() {
                    return Err(Error::InvalidState(format!(
                        "filesystem {} has no frozen snapshot to clone",
                        parent
                    )));
                }
                copy_tree(&snap, &live)?;
                let marker = self.origin_marker(id);
                fs::write(&marker, parent.as_str()).with_path(&marker)?;
            }
            None => fs::create_dir(&live).with_path(&live)?,
        }
        debug!(fs = %id, path = %live.display(), "created directory store");
        Ok(live.to_string_lossy().into_owned())
    }

    fn mount(&self, id: &FilesystemId) -> Result<PathBuf> {
        let live = self.live(id);
        if !live.is_dir() {
            return Err(Error::not_found("filesystem", id));
        }
        Ok(live)
    }

    fn unmount(&self, _id: &FilesystemId) -> Result<()> {
        Ok(())
    }

    fn freeze(&self, id: &FilesystemId) -> Result<SnapshotRef> {
        let snap = self.snapshot(id);
        if snap.exists() {
            if !self.clones_of(id)?.is_empty() {
                return Err(Error::InUse(format!(
                    "snapshot of {} has clones and cannot be replaced",
                    id
                )));
            }
            remove_path(&snap)?;
        }
        copy_tree(&self.live(id), &snap)?;
        Ok(SnapshotRef(snap.to_string_lossy().into_owned()))
    }

    fn seal(&self, _id: &FilesystemId) -> Result<()> {
        // a plain directory has no read-only switch short of chmod, which
        // would change the metadata the layer was hashed over
        Ok(())
    }

    fn root_path(&self, id: &FilesystemId) -> PathBuf {
        self.live(id)
    }

    fn snapshot_path(&self, id: &FilesystemId) -> Result<PathBuf> {
        let snap = self.snapshot(id);
        if !snap.is_dir() {
            return Err(Error::InvalidState(format!("filesystem {} is not frozen", id)));
        }
        Ok(snap)
    }

    fn native_diff(
        &self,
        id: &FilesystemId,
        _parent: &FilesystemId,
        _source: DiffSource,
    ) -> Result<Changeset> {
        Err(Error::backend("diff", id.as_str(), "no native diff for directory stores"))
    }

    fn remove(&self, id: &FilesystemId) -> Result<()> {
        let clones = self.clones_of(id)?;
        if !clones.is_empty() {
            return Err(Error::InUse(format!(
                "filesystem {} has clones: {}",
                id,
                clones.join(", ")
            )));
        }
        remove_path(&self.live(id))?;
        remove_path(&self.snapshot(id))?;
        remove_path(&self.origin_marker(id))?;
        debug!(fs = %id, "removed directory store");
        Ok(())
    }

    fn exists(&self, id: &FilesystemId) -> Result<bool> {
        Ok(self.live(id).is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use tempfile::tempdir;

    fn test_backend() -> (tempfile::TempDir, DirBackend) {
        let dir = tempdir().unwrap();
        let backend = DirBackend::new(dir.path().join("dir"));
        backend.prepare().unwrap();
        (dir, backend)
    }

    #[test]
    fn test_validate_requires_base() {
        let dir = tempdir().unwrap();
        let backend = DirBackend::new(dir.path().join("missing"));
        assert!(matches!(backend.validate(), Err(Error::BackendUnavailable(_))));
    }

    #[test]
    fn test_clone_sees_parent_snapshot_not_later_writes() {
        let (_dir, backend) = test_backend();
        let parent = FilesystemId::generate();
        backend.create(&parent, None).unwrap();
        let root = backend.mount(&parent).unwrap();
        fs::write(root.join("a"), "frozen").unwrap();
        backend.freeze(&parent).unwrap();
        fs::write(root.join("a"), "after freeze").unwrap();

        let child = FilesystemId::generate();
        backend.create(&child, Some(&parent)).unwrap();
        let child_root = backend.mount(&child).unwrap();
        assert_eq!(fs::read_to_string(child_root.join("a")).unwrap(), "frozen");
    }

    #[test]
    fn test_clone_requires_frozen_parent() {
        let (_dir, backend) = test_backend();
        let parent = FilesystemId::generate();
        backend.create(&parent, None).unwrap();

        let child = FilesystemId::generate();
        let err = backend.create(&child, Some(&parent)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(!backend.exists(&child).unwrap());
    }

    #[test]
    fn test_remove_refused_while_cloned() {
        let (_dir, backend) = test_backend();
        let parent = FilesystemId::generate();
        backend.create(&parent, None).unwrap();
        backend.freeze(&parent).unwrap();
        let child = FilesystemId::generate();
        backend.create(&child, Some(&parent)).unwrap();

        assert!(matches!(backend.remove(&parent), Err(Error::InUse(_))));
        backend.remove(&child).unwrap();
        backend.remove(&parent).unwrap();
        assert!(!backend.exists(&parent).unwrap());
    }

    #[test]
    fn test_fallback_diff_against_parent() {
        let (_dir, backend) = test_backend();
        let parent = FilesystemId::generate();
        backend.create(&parent, None).unwrap();
        let root = backend.mount(&parent).unwrap();
        fs::write(root.join("a"), "0123456789").unwrap();
        backend.freeze(&parent).unwrap();

        let child = FilesystemId::generate();
        backend.create(&child, Some(&parent)).unwrap();
        let child_root = backend.mount(&child).unwrap();
        fs::write(child_root.join("b"), "hello").unwrap();

        let live = backend.diff(&child, Some(&parent), DiffSource::Live).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live.get("/b").unwrap().kind, ChangeKind::Added);

        backend.freeze(&child).unwrap();
        let frozen = backend.diff(&child, Some(&parent), DiffSource::Snapshot).unwrap();
        assert_eq!(frozen, live);
    }
}
