use std::path::Path;

use tracing::{debug, info, warn};

use crate::backend::DiffSource;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::id::{DiffId, FilesystemId, LayerId};
use crate::ops::changeset::write_changeset_file;
use crate::ops::filesystem::{
    destroy_locked, filesystem, filesystem_children, freeze_locked, lock_filesystem,
    save_filesystem,
};
use crate::ops::layer::{lock_layer, save_layer, try_layer};
use crate::record::store_blob;
use crate::types::{now, Filesystem, FilesystemState, Layer, MEDIA_TYPE_LAYER_TAR};

/// commit a mounted filesystem into an immutable layer
///
/// the filesystem is frozen, diffed against its parent's snapshot and the
/// changeset serialized to a tar whose digest is the diff id. when a layer
/// with that diff id already sits on the same parent, that layer is
/// returned and the now redundant filesystem is destroyed.
pub fn commit(graph: &Graph, id: &FilesystemId) -> Result<Layer> {
    commit_with(graph, id, None)
}

/// commit a filesystem whose changes were applied from `tar`, a verified
/// changeset stream with digest `diff_id`
///
/// the stream becomes the layer blob as is, so the layer keeps `diff_id`
/// even where the applied tree cannot reproduce it byte for byte (ownership
/// is only restored when running as root).
pub(crate) fn commit_archived(
    graph: &Graph,
    id: &FilesystemId,
    diff_id: DiffId,
    tar: &Path,
) -> Result<Layer> {
    commit_with(graph, id, Some((diff_id, tar)))
}

fn commit_with(
    graph: &Graph,
    id: &FilesystemId,
    archived: Option<(DiffId, &Path)>,
) -> Result<Layer> {
    let _fs_lock = lock_filesystem(graph, id)?;
    let mut fs = filesystem(graph, id)?;

    if fs.is_committed() {
        return Err(Error::InvalidState(format!(
            "filesystem {} is already committed as layer {}",
            id,
            fs.layer.as_ref().map(|l| l.short()).unwrap_or_default()
        )));
    }
    if !fs.is_mounted() {
        return Err(Error::InvalidState(format!(
            "filesystem {} is {}, only mounted filesystems can be committed",
            id, fs.state
        )));
    }
    if let Some(container) = &fs.container {
        return Err(Error::InvalidState(format!(
            "filesystem {} belongs to container {}",
            id,
            container.short()
        )));
    }
    // clones pin the current snapshot, which commit replaces and a dedup
    // hit would destroy
    let clones = filesystem_children(graph, id)?;
    if !clones.is_empty() {
        return Err(Error::InUse(format!(
            "filesystem {} has {} clones; remove them before committing",
            id,
            clones.len()
        )));
    }
    let parent_layer = parent_layer(graph, &fs)?;

    debug!(fs = %id, "committing filesystem");
    freeze_locked(graph, &mut fs)?;
    let backend = graph.backend();
    let changeset = backend.diff(id, fs.parent.as_ref(), DiffSource::Snapshot)?;

    let (diff_id, tmp) = match archived {
        Some((diff_id, tar)) => (diff_id, tar.to_path_buf()),
        None => {
            let tmp = graph.tmp_file();
            let written = backend
                .snapshot_path(id)
                .and_then(|root| write_changeset_file(&root, &changeset, &tmp));
            match written {
                Ok((diff_id, _)) => (diff_id, tmp),
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e);
                }
            }
        }
    };

    let layer_id = LayerId::chain(parent_layer.as_ref(), &diff_id);
    let _layer_lock = lock_layer(graph, &layer_id)?;

    if let Some(existing) = try_layer(graph, &layer_id)? {
        let _ = std::fs::remove_file(&tmp);
        debug!(fs = %id, layer = %layer_id, "identical layer exists");
        match destroy_locked(graph, fs) {
            Ok(_) => {}
            Err(e) => warn!(fs = %id, error = %e, "failed to remove redundant filesystem"),
        }
        return Ok(existing);
    }

    store_blob(graph, &tmp, diff_id.digest())?;
    backend.seal(id)?;

    let layer = Layer {
        id: layer_id,
        diff_id,
        parent: parent_layer,
        size_bytes: changeset.size_bytes(),
        media_type: MEDIA_TYPE_LAYER_TAR.to_string(),
        filesystem: id.clone(),
        changeset,
        created: now(),
    };

    fs.state = FilesystemState::Committed;
    fs.layer = Some(layer.id.clone());
    save_filesystem(graph, &fs)?;
    save_layer(graph, &layer)?;

    info!(
        fs = %id,
        layer = %layer.id,
        diff_id = %layer.diff_id,
        size = layer.size_bytes,
        "committed layer"
    );
    Ok(layer)
}

/// the layer a filesystem's parent was committed as
fn parent_layer(graph: &Graph, fs: &Filesystem) -> Result<Option<LayerId>> {
    let Some(parent) = &fs.parent else {
        return Ok(None);
    };
    let parent_fs = filesystem(graph, parent)?;
    match parent_fs.layer {
        Some(layer) if parent_fs.is_committed() => Ok(Some(layer)),
        _ => Err(Error::InvalidState(format!(
            "parent filesystem {} of {} is not a committed layer",
            parent, fs.id
        ))),
    }
}
