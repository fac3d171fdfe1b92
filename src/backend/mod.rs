//! copy-on-write storage backends
//!
//! a backend stores one tree per filesystem id and knows how to clone a
//! frozen snapshot of one filesystem into a new one. callers only see the
//! [`GraphBackend`] trait; which implementation runs is decided by the
//! store configuration.

mod dir;
mod zfs;

use std::path::{Path, PathBuf};

pub use dir::DirBackend;
pub use zfs::{parse_zfs_diff, SystemZfs, ZfsBackend, ZfsCommand, ZfsDiffLine, ZfsOutput};

use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::id::FilesystemId;
use crate::ops::diff::fallback_diff;
use crate::types::{Changeset, SnapshotRef};

/// optional features a backend may offer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// the backend can list changed paths from snapshot metadata
    pub native_diff: bool,
}

/// which state of a filesystem a diff reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffSource {
    /// the frozen snapshot taken by `freeze`
    Snapshot,
    /// the live, possibly still changing tree
    Live,
}

/// contract with the underlying copy-on-write storage
pub trait GraphBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// one-time setup of backing storage for a new store
    fn prepare(&self) -> Result<()>;

    /// fail with `BackendUnavailable` unless the storage is usable
    fn validate(&self) -> Result<()>;

    /// allocate storage for `id`: a clone of `parent`'s frozen snapshot, or
    /// empty. returns the backend handle.
    fn create(&self, id: &FilesystemId, parent: Option<&FilesystemId>) -> Result<String>;

    /// make the live tree reachable; no-op when already mounted
    fn mount(&self, id: &FilesystemId) -> Result<PathBuf>;

    /// no-op when not mounted
    fn unmount(&self, id: &FilesystemId) -> Result<()>;

    /// take the point-in-time snapshot children are cloned from
    fn freeze(&self, id: &FilesystemId) -> Result<SnapshotRef>;

    /// make the live tree read-only for good
    fn seal(&self, id: &FilesystemId) -> Result<()>;

    /// location of the live tree
    fn root_path(&self, id: &FilesystemId) -> PathBuf;

    /// location of the frozen snapshot, made readable if needed
    fn snapshot_path(&self, id: &FilesystemId) -> Result<PathBuf>;

    /// changes of `id` against `parent`'s snapshot, from backend metadata.
    /// only called when `capabilities().native_diff` is set.
    fn native_diff(
        &self,
        id: &FilesystemId,
        parent: &FilesystemId,
        source: DiffSource,
    ) -> Result<Changeset>;

    /// destroy storage for `id`; `InUse` while clones of it exist
    fn remove(&self, id: &FilesystemId) -> Result<()>;

    fn exists(&self, id: &FilesystemId) -> Result<bool>;

    /// changes of `id` against `parent`'s snapshot (or an empty tree)
    ///
    /// uses the native path when the backend offers one, otherwise walks
    /// both trees. a base filesystem has no snapshot to diff against
    /// natively and always walks.
    fn diff(
        &self,
        id: &FilesystemId,
        parent: Option<&FilesystemId>,
        source: DiffSource,
    ) -> Result<Changeset> {
        if let (true, Some(parent)) = (self.capabilities().native_diff, parent) {
            return self.native_diff(id, parent, source);
        }
        let new_root = match source {
            DiffSource::Snapshot => self.snapshot_path(id)?,
            DiffSource::Live => self.root_path(id),
        };
        let old_root = match parent {
            Some(parent) => Some(self.snapshot_path(parent)?),
            None => None,
        };
        fallback_diff(old_root.as_deref(), &new_root)
    }
}

/// build the backend a store's config asks for
pub fn open_backend(root: &Path, config: &Config) -> Result<Box<dyn GraphBackend>> {
    let backend: Box<dyn GraphBackend> = match config.backend.kind {
        BackendKind::Dir => Box::new(DirBackend::new(root.join("dir"))),
        BackendKind::Zfs => Box::new(ZfsBackend::new(
            config.backend.zfs.clone(),
            root.join("mnt"),
            Box::new(SystemZfs::new(&config.backend.zfs)),
        )),
    };
    Ok(backend)
}
