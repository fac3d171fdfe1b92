use std::path::PathBuf;

use tracing::info;

use crate::error::{Error, Result};
use crate::graph::{Graph, GraphLock};
use crate::id::{DiffId, LayerId};
use crate::ops::filesystem::{destroy_locked, filesystem, filesystem_children, lock_filesystem};
use crate::ops::image::list_images;
use crate::record::{
    blob_path, delete_record, list_records, read_record, record_exists, remove_blob, write_record,
};
use crate::types::Layer;

pub(crate) fn lock_layer(graph: &Graph, id: &LayerId) -> Result<GraphLock> {
    graph.lock("layer", &id.digest().to_hex())
}

pub(crate) fn save_layer(graph: &Graph, layer: &Layer) -> Result<()> {
    write_record(graph, &graph.layers_path(), &layer.id.digest().to_hex(), layer)
}

/// read a layer record
pub fn layer(graph: &Graph, id: &LayerId) -> Result<Layer> {
    read_record(&graph.layers_path(), &id.digest().to_hex(), "layer")
}

pub(crate) fn try_layer(graph: &Graph, id: &LayerId) -> Result<Option<Layer>> {
    match layer(graph, id) {
        Ok(layer) => Ok(Some(layer)),
        Err(Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn layer_exists(graph: &Graph, id: &LayerId) -> bool {
    record_exists(&graph.layers_path(), &id.digest().to_hex())
}

/// all layers, ordered by id
pub fn list_layers(graph: &Graph) -> Result<Vec<Layer>> {
    let mut layers = Vec::new();
    for name in list_records(&graph.layers_path())? {
        let id = LayerId::parse(&name)?;
        layers.push(layer(graph, &id)?);
    }
    Ok(layers)
}

/// the layer holding `diff_id` on top of `parent`, if one was committed
pub fn find_layer(graph: &Graph, diff_id: &DiffId, parent: Option<&LayerId>) -> Result<Option<Layer>> {
    try_layer(graph, &LayerId::chain(parent, diff_id))
}

/// layers whose parent is `id`
pub fn layer_children(graph: &Graph, id: &LayerId) -> Result<Vec<Layer>> {
    Ok(list_layers(graph)?
        .into_iter()
        .filter(|l| l.parent.as_ref() == Some(id))
        .collect())
}

/// uncompressed changeset tar of a layer
pub fn layer_blob_path(graph: &Graph, layer: &Layer) -> PathBuf {
    blob_path(graph, layer.diff_id.digest())
}

/// delete a layer together with its filesystem
///
/// refused with `InUse` while an image references the layer, a child
/// layer sits on it, or a filesystem is cloned from it. the changeset blob
/// goes too unless another layer carries the same diff id.
pub fn remove_layer(graph: &Graph, id: &LayerId) -> Result<Layer> {
    let _store_lock = graph.lock_store()?;
    remove_layer_locked(graph, id)
}

/// `remove_layer` with the store lock already held
pub(crate) fn remove_layer_locked(graph: &Graph, id: &LayerId) -> Result<Layer> {
    let _lock = lock_layer(graph, id)?;
    let layer = layer(graph, id)?;

    if let Some(image) = list_images(graph)?.iter().find(|i| i.layers.contains(id)) {
        return Err(Error::InUse(format!(
            "layer {} is part of image {}",
            id.short(),
            image.id.short()
        )));
    }
    if let Some(child) = layer_children(graph, id)?.first() {
        return Err(Error::InUse(format!(
            "layer {} is the parent of layer {}",
            id.short(),
            child.id.short()
        )));
    }

    let _fs_lock = lock_filesystem(graph, &layer.filesystem)?;
    if let Some(child) = filesystem_children(graph, &layer.filesystem)?.first() {
        return Err(Error::InUse(format!(
            "layer {} has filesystem {} cloned from it",
            id.short(),
            child.id
        )));
    }

    // record first: a committed filesystem without a layer is left for gc
    delete_record(&graph.layers_path(), &id.digest().to_hex())?;
    match filesystem(graph, &layer.filesystem) {
        Ok(fs) => {
            destroy_locked(graph, fs)?;
        }
        Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    let shared = list_layers(graph)?.iter().any(|l| l.diff_id == layer.diff_id);
    if !shared {
        remove_blob(graph, layer.diff_id.digest())?;
    }

    info!(layer = %id, diff_id = %layer.diff_id, "removed layer");
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::test_graph;
    use crate::ops::commit::commit;
    use crate::ops::filesystem::{
        create_filesystem, create_filesystem_from_layer, filesystem_exists, mount_filesystem,
        remove_filesystem, unmount_filesystem,
    };
    use crate::ops::image::register_image;
    use std::fs;

    fn commit_file(graph: &Graph, parent: Option<&LayerId>, name: &str, body: &str) -> Layer {
        let f = match parent {
            Some(parent) => create_filesystem_from_layer(graph, parent).unwrap(),
            None => create_filesystem(graph, None).unwrap(),
        };
        let root = mount_filesystem(graph, &f.id).unwrap();
        fs::write(root.join(name), body).unwrap();
        commit(graph, &f.id).unwrap()
    }

    #[test]
    fn test_find_layer_by_diff_id_and_parent() {
        let (_dir, graph) = test_graph();
        let base = commit_file(&graph, None, "a", "base");
        let top = commit_file(&graph, Some(&base.id), "b", "top");

        assert_eq!(find_layer(&graph, &base.diff_id, None).unwrap(), Some(base.clone()));
        assert_eq!(find_layer(&graph, &top.diff_id, Some(&base.id)).unwrap(), Some(top.clone()));
        // same diff id on a different parent is a different layer
        assert!(find_layer(&graph, &top.diff_id, None).unwrap().is_none());
        assert_eq!(layer_children(&graph, &base.id).unwrap(), vec![top]);
    }

    #[test]
    fn test_remove_layer_with_child_is_in_use() {
        let (_dir, graph) = test_graph();
        let base = commit_file(&graph, None, "a", "base");
        let top = commit_file(&graph, Some(&base.id), "b", "top");

        assert!(matches!(remove_layer(&graph, &base.id), Err(Error::InUse(_))));
        remove_layer(&graph, &top.id).unwrap();
        remove_layer(&graph, &base.id).unwrap();

        assert!(list_layers(&graph).unwrap().is_empty());
        assert!(!layer_blob_path(&graph, &base).exists());
        assert!(!filesystem_exists(&graph, &base.filesystem).unwrap());
    }

    #[test]
    fn test_remove_layer_in_image_is_in_use() {
        let (_dir, graph) = test_graph();
        let base = commit_file(&graph, None, "a", "base");
        register_image(&graph, vec![base.id.clone()], b"{}").unwrap();

        assert!(matches!(remove_layer(&graph, &base.id), Err(Error::InUse(_))));
        assert!(layer_exists(&graph, &base.id));
    }

    #[test]
    fn test_remove_layer_with_cloned_filesystem_is_in_use() {
        let (_dir, graph) = test_graph();
        let base = commit_file(&graph, None, "a", "base");
        let work = create_filesystem_from_layer(&graph, &base.id).unwrap();

        assert!(matches!(remove_layer(&graph, &base.id), Err(Error::InUse(_))));

        unmount_filesystem(&graph, &work.id).unwrap();
        remove_filesystem(&graph, &work.id).unwrap();
        remove_layer(&graph, &base.id).unwrap();
    }

    #[test]
    fn test_shared_blob_survives_removal() {
        let (_dir, graph) = test_graph();
        let a = commit_file(&graph, None, "x", "one");
        let b = commit_file(&graph, Some(&a.id), "y", "two");
        // the same change on another parent shares the blob
        let other = commit_file(&graph, None, "z", "three");
        let c = commit_file(&graph, Some(&other.id), "y", "two");
        assert_eq!(b.diff_id, c.diff_id);
        assert_ne!(b.id, c.id);

        remove_layer(&graph, &b.id).unwrap();
        assert!(layer_blob_path(&graph, &c).is_file());
    }
}
