use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::graph::{Graph, GraphLock};
use crate::id::{FilesystemId, LayerId};
use crate::ops::layer::layer;
use crate::record::{
    delete_record, list_records, read_record, record_exists, write_record,
};
use crate::types::{Filesystem, FilesystemState, SnapshotRef};

pub(crate) fn lock_filesystem(graph: &Graph, id: &FilesystemId) -> Result<GraphLock> {
    graph.lock("fs", id.as_str())
}

pub(crate) fn save_filesystem(graph: &Graph, fs: &Filesystem) -> Result<()> {
    write_record(graph, &graph.filesystems_path(), fs.id.as_str(), fs)
}

/// read a filesystem record
pub fn filesystem(graph: &Graph, id: &FilesystemId) -> Result<Filesystem> {
    read_record(&graph.filesystems_path(), id.as_str(), "filesystem")
}

/// all filesystem records, ordered by id
pub fn list_filesystems(graph: &Graph) -> Result<Vec<Filesystem>> {
    let mut filesystems = Vec::new();
    for name in list_records(&graph.filesystems_path())? {
        let id = FilesystemId::parse(&name)?;
        filesystems.push(filesystem(graph, &id)?);
    }
    Ok(filesystems)
}

/// true if both the record and the backing store exist
pub fn filesystem_exists(graph: &Graph, id: &FilesystemId) -> Result<bool> {
    Ok(record_exists(&graph.filesystems_path(), id.as_str()) && graph.backend().exists(id)?)
}

/// allocate a new filesystem, empty or cloned from `parent`'s snapshot
pub fn create_filesystem(graph: &Graph, parent: Option<&FilesystemId>) -> Result<Filesystem> {
    // the parent's lock keeps it from being removed mid-clone
    let _parent_lock = match parent {
        Some(parent) => {
            let lock = lock_filesystem(graph, parent)?;
            let parent_fs = filesystem(graph, parent)?;
            if !parent_fs.is_frozen() {
                return Err(Error::InvalidState(format!(
                    "filesystem {} must be frozen before it can be cloned",
                    parent
                )));
            }
            Some(lock)
        }
        None => None,
    };

    let id = FilesystemId::generate();
    let _lock = lock_filesystem(graph, &id)?;
    let backend = graph.backend();
    let backend_ref = backend.create(&id, parent)?;

    let fs = Filesystem {
        mount_path: backend.root_path(&id),
        id: id.clone(),
        backend_ref,
        parent: parent.cloned(),
        state: FilesystemState::Created,
        snapshot: None,
        layer: None,
        container: None,
    };
    if let Err(e) = save_filesystem(graph, &fs) {
        if let Err(cleanup) = backend.remove(&id) {
            warn!(fs = %id, error = %cleanup, "failed to clean up backing store");
        }
        return Err(e);
    }

    info!(fs = %id, parent = ?parent.map(FilesystemId::as_str), "created filesystem");
    Ok(fs)
}

/// allocate a writable filesystem cloned from a committed layer
pub fn create_filesystem_from_layer(graph: &Graph, layer_id: &LayerId) -> Result<Filesystem> {
    let layer = layer(graph, layer_id)?;
    create_filesystem(graph, Some(&layer.filesystem))
}

/// make a filesystem's tree reachable at its mount path
///
/// mounting an already mounted filesystem is a no-op. committed
/// filesystems are read-only and cannot be mounted for mutation.
pub fn mount_filesystem(graph: &Graph, id: &FilesystemId) -> Result<PathBuf> {
    let _lock = lock_filesystem(graph, id)?;
    let mut fs = filesystem(graph, id)?;

    match fs.state {
        FilesystemState::Mounted => Ok(fs.mount_path),
        FilesystemState::Created | FilesystemState::Unmounted => {
            let path = graph.backend().mount(id)?;
            fs.state = FilesystemState::Mounted;
            fs.mount_path = path.clone();
            save_filesystem(graph, &fs)?;
            debug!(fs = %id, path = %path.display(), "mounted filesystem");
            Ok(path)
        }
        state => Err(Error::InvalidState(format!(
            "filesystem {} is {} and cannot be mounted",
            id, state
        ))),
    }
}

/// unmount a filesystem; a no-op unless it is mounted
pub fn unmount_filesystem(graph: &Graph, id: &FilesystemId) -> Result<()> {
    let _lock = lock_filesystem(graph, id)?;
    let mut fs = filesystem(graph, id)?;

    if fs.state == FilesystemState::Mounted {
        graph.backend().unmount(id)?;
        fs.state = FilesystemState::Unmounted;
        save_filesystem(graph, &fs)?;
        debug!(fs = %id, "unmounted filesystem");
    }
    Ok(())
}

/// take the snapshot that children of `id` are cloned from
pub fn freeze_filesystem(graph: &Graph, id: &FilesystemId) -> Result<SnapshotRef> {
    let _lock = lock_filesystem(graph, id)?;
    let mut fs = filesystem(graph, id)?;
    if fs.is_committed() {
        return Err(Error::InvalidState(format!(
            "filesystem {} is committed and already frozen",
            id
        )));
    }
    freeze_locked(graph, &mut fs)
}

/// freeze with the filesystem lock already held
pub(crate) fn freeze_locked(graph: &Graph, fs: &mut Filesystem) -> Result<SnapshotRef> {
    let snapshot = graph.backend().freeze(&fs.id)?;
    fs.snapshot = Some(snapshot.clone());
    save_filesystem(graph, fs)?;
    debug!(fs = %fs.id, %snapshot, "froze filesystem");
    Ok(snapshot)
}

/// destroy an unmounted, uncommitted filesystem
///
/// fails with `InUse` while it is mounted, owned by a container, or has
/// clones; committed filesystems go away with their layer.
pub fn remove_filesystem(graph: &Graph, id: &FilesystemId) -> Result<Filesystem> {
    let _lock = lock_filesystem(graph, id)?;
    let fs = filesystem(graph, id)?;

    match fs.state {
        FilesystemState::Mounted => {
            return Err(Error::InUse(format!("filesystem {} is mounted", id)));
        }
        FilesystemState::Committed => {
            return Err(Error::InvalidState(format!(
                "filesystem {} backs layer {}; remove the layer instead",
                id,
                fs.layer.map(|l| l.to_string()).unwrap_or_default()
            )));
        }
        _ => {}
    }
    if let Some(container) = &fs.container {
        if record_exists(&graph.containers_path(), container.as_str()) {
            return Err(Error::InUse(format!(
                "filesystem {} belongs to container {}",
                id,
                container.short()
            )));
        }
    }

    destroy_locked(graph, fs)
}

/// unmount and destroy storage and record, with the filesystem lock held
pub(crate) fn destroy_locked(graph: &Graph, mut fs: Filesystem) -> Result<Filesystem> {
    let backend = graph.backend();
    backend.unmount(&fs.id)?;
    backend.remove(&fs.id)?;
    delete_record(&graph.filesystems_path(), fs.id.as_str())?;
    info!(fs = %fs.id, "removed filesystem");
    fs.state = FilesystemState::Removed;
    Ok(fs)
}

/// best-effort unmount and removal of a filesystem a failed operation
/// left behind
pub(crate) fn discard_filesystem(graph: &Graph, id: &FilesystemId) {
    let result = unmount_filesystem(graph, id).and_then(|()| remove_filesystem(graph, id));
    if let Err(e) = result {
        warn!(fs = %id, error = %e, "failed to discard filesystem");
    }
}

/// filesystems cloned from `id`
pub fn filesystem_children(graph: &Graph, id: &FilesystemId) -> Result<Vec<Filesystem>> {
    Ok(list_filesystems(graph)?
        .into_iter()
        .filter(|fs| fs.parent.as_ref() == Some(id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::test_graph;
    use std::fs;

    #[test]
    fn test_create_and_read_filesystem() {
        let (_dir, graph) = test_graph();
        let fs = create_filesystem(&graph, None).unwrap();

        assert_eq!(fs.state, FilesystemState::Created);
        assert_eq!(fs.id.as_str().len(), 16);
        assert!(filesystem_exists(&graph, &fs.id).unwrap());
        assert_eq!(filesystem(&graph, &fs.id).unwrap(), fs);
        assert_eq!(list_filesystems(&graph).unwrap().len(), 1);
    }

    #[test]
    fn test_mount_unmount_idempotent() {
        let (_dir, graph) = test_graph();
        let fs = create_filesystem(&graph, None).unwrap();

        // unmounting a never-mounted filesystem is a no-op
        unmount_filesystem(&graph, &fs.id).unwrap();

        let p1 = mount_filesystem(&graph, &fs.id).unwrap();
        let p2 = mount_filesystem(&graph, &fs.id).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(filesystem(&graph, &fs.id).unwrap().state, FilesystemState::Mounted);

        unmount_filesystem(&graph, &fs.id).unwrap();
        unmount_filesystem(&graph, &fs.id).unwrap();
        assert_eq!(filesystem(&graph, &fs.id).unwrap().state, FilesystemState::Unmounted);
    }

    #[test]
    fn test_clone_requires_frozen_parent() {
        let (_dir, graph) = test_graph();
        let parent = create_filesystem(&graph, None).unwrap();
        let err = create_filesystem(&graph, Some(&parent.id)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_remove_mounted_is_in_use() {
        let (_dir, graph) = test_graph();
        let fs = create_filesystem(&graph, None).unwrap();
        mount_filesystem(&graph, &fs.id).unwrap();

        assert!(matches!(remove_filesystem(&graph, &fs.id), Err(Error::InUse(_))));
        unmount_filesystem(&graph, &fs.id).unwrap();
        let removed = remove_filesystem(&graph, &fs.id).unwrap();
        assert_eq!(removed.state, FilesystemState::Removed);
        assert!(!filesystem_exists(&graph, &fs.id).unwrap());
    }

    #[test]
    fn test_remove_with_clone_is_in_use() {
        let (_dir, graph) = test_graph();
        let f0 = create_filesystem(&graph, None).unwrap();
        let root = mount_filesystem(&graph, &f0.id).unwrap();
        fs::write(root.join("a"), "0123456789").unwrap();
        freeze_filesystem(&graph, &f0.id).unwrap();
        unmount_filesystem(&graph, &f0.id).unwrap();

        let f1 = create_filesystem(&graph, Some(&f0.id)).unwrap();
        assert_eq!(filesystem_children(&graph, &f0.id).unwrap().len(), 1);
        assert!(matches!(remove_filesystem(&graph, &f0.id), Err(Error::InUse(_))));

        remove_filesystem(&graph, &f1.id).unwrap();
        remove_filesystem(&graph, &f0.id).unwrap();
        assert!(list_filesystems(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_clone_starts_from_snapshot() {
        let (_dir, graph) = test_graph();
        let f0 = create_filesystem(&graph, None).unwrap();
        let root = mount_filesystem(&graph, &f0.id).unwrap();
        fs::write(root.join("a"), "frozen").unwrap();
        freeze_filesystem(&graph, &f0.id).unwrap();

        let f1 = create_filesystem(&graph, Some(&f0.id)).unwrap();
        assert_eq!(f1.parent.as_ref(), Some(&f0.id));
        let root1 = mount_filesystem(&graph, &f1.id).unwrap();
        assert_eq!(fs::read_to_string(root1.join("a")).unwrap(), "frozen");
    }
}
