use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::remove_path;
use crate::graph::Graph;
use crate::hash::Digest;
use crate::id::{ContainerId, FilesystemId, LayerId};
use crate::ops::container::list_containers;
use crate::ops::filesystem::{destroy_locked, filesystem, list_filesystems, lock_filesystem};
use crate::ops::image::list_images;
use crate::ops::layer::{list_layers, lock_layer};
use crate::record::{blob_path, delete_record, list_blobs, remove_blob};
use crate::types::{Filesystem, Layer};

/// staging files younger than this may belong to a running operation
const STAGING_GRACE: Duration = Duration::from_secs(60 * 60);

/// gc statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub layers_removed: usize,
    pub filesystems_removed: usize,
    pub blobs_removed: usize,
    pub bytes_freed: u64,
    pub staging_removed: usize,
}

/// remove everything no image, container or in-progress build can reach
///
/// a layer survives when an image lists it, a filesystem is cloned from
/// it, or a surviving layer sits on it. dead layers go leaf-first with
/// their filesystems. committed filesystems without a layer and
/// filesystems of vanished containers are destroyed, then unreferenced
/// blobs and stale staging files. layers committed by a build that has
/// not registered its image yet count as dead.
pub fn gc(graph: &Graph, dry_run: bool) -> Result<GcStats> {
    let _lock = graph.lock_store()?;
    let mut stats = GcStats::default();

    let layers = list_layers(graph)?;
    let filesystems = list_filesystems(graph)?;
    let containers: HashSet<_> = list_containers(graph)?.into_iter().map(|c| c.id).collect();

    // mark phase
    let layer_ids: HashSet<LayerId> = layers.iter().map(|l| l.id).collect();
    let orphans: Vec<&Filesystem> = filesystems
        .iter()
        .filter(|fs| is_orphan(fs, &layer_ids, &containers))
        .collect();
    let orphan_ids: HashSet<&FilesystemId> = orphans.iter().map(|fs| &fs.id).collect();
    let live = live_layers(graph, &layers, &filesystems, &orphan_ids)?;

    // sweep orphaned filesystems, clones before their origins
    for fs in orphans.iter().rev() {
        if dry_run {
            stats.filesystems_removed += 1;
            continue;
        }
        if sweep_filesystem(graph, &fs.id)? == Sweep::Removed {
            stats.filesystems_removed += 1;
        }
    }

    // sweep dead layers leaf-first
    let by_id: HashMap<LayerId, &Layer> = layers.iter().map(|l| (l.id, l)).collect();
    let mut dead: Vec<&Layer> = layers.iter().filter(|l| !live.contains(&l.id)).collect();
    dead.sort_by_key(|l| std::cmp::Reverse(depth(l, &by_id)));
    let mut pinned = HashSet::new();
    for layer in &dead {
        if dry_run {
            stats.layers_removed += 1;
            stats.filesystems_removed += 1;
            continue;
        }
        let _layer_lock = lock_layer(graph, &layer.id)?;
        match sweep_filesystem(graph, &layer.filesystem)? {
            Sweep::Removed => stats.filesystems_removed += 1,
            Sweep::Missing => {}
            Sweep::Pinned => {
                // the record stays until its filesystem can go
                pinned.insert(layer.id);
                continue;
            }
        }
        delete_record(&graph.layers_path(), &layer.id.digest().to_hex())?;
        stats.layers_removed += 1;
        debug!(layer = %layer.id, "collected layer");
    }

    // sweep blobs nothing refers to any more
    let mut referenced: HashSet<Digest> = layers
        .iter()
        .filter(|l| live.contains(&l.id) || pinned.contains(&l.id))
        .map(|l| *l.diff_id.digest())
        .collect();
    referenced.extend(list_images(graph)?.into_iter().map(|i| i.config));
    for digest in list_blobs(graph)? {
        if referenced.contains(&digest) {
            continue;
        }
        let path = blob_path(graph, &digest);
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if !dry_run {
            remove_blob(graph, &digest)?;
        }
        stats.blobs_removed += 1;
        stats.bytes_freed += size;
    }

    stats.staging_removed = sweep_staging(graph, dry_run)?;

    info!(
        dry_run,
        layers = stats.layers_removed,
        filesystems = stats.filesystems_removed,
        blobs = stats.blobs_removed,
        bytes = stats.bytes_freed,
        "garbage collected"
    );
    Ok(stats)
}

/// a committed filesystem whose layer is gone, or a container's
/// filesystem whose container is gone
fn is_orphan(
    fs: &Filesystem,
    layers: &HashSet<LayerId>,
    containers: &HashSet<ContainerId>,
) -> bool {
    if fs.is_committed() {
        return !fs.layer.as_ref().is_some_and(|l| layers.contains(l));
    }
    fs.container.as_ref().is_some_and(|c| !containers.contains(c))
}

/// layers reachable from images and from live clones, plus their ancestors
fn live_layers(
    graph: &Graph,
    layers: &[Layer],
    filesystems: &[Filesystem],
    orphans: &HashSet<&FilesystemId>,
) -> Result<HashSet<LayerId>> {
    let mut live: HashSet<LayerId> = list_images(graph)?
        .iter()
        .flat_map(|i| i.layers.iter().copied())
        .collect();

    for layer in layers {
        let cloned = filesystems.iter().any(|fs| {
            fs.parent.as_ref() == Some(&layer.filesystem) && !orphans.contains(&fs.id)
        });
        if cloned {
            live.insert(layer.id);
        }
    }

    let by_id: HashMap<LayerId, &Layer> = layers.iter().map(|l| (l.id, l)).collect();
    let mut stack: Vec<LayerId> = live.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if let Some(parent) = by_id.get(&id).and_then(|l| l.parent) {
            if live.insert(parent) {
                stack.push(parent);
            }
        }
    }
    Ok(live)
}

fn depth(layer: &Layer, by_id: &HashMap<LayerId, &Layer>) -> usize {
    let mut depth = 0;
    let mut current = layer.parent;
    while let Some(id) = current {
        depth += 1;
        current = by_id.get(&id).and_then(|l| l.parent);
    }
    depth
}

/// destroy a filesystem if it still exists and has no clones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    Removed,
    /// no record left to remove
    Missing,
    /// still has clones
    Pinned,
}

fn sweep_filesystem(graph: &Graph, id: &FilesystemId) -> Result<Sweep> {
    let _lock = lock_filesystem(graph, id)?;
    let fs = match filesystem(graph, id) {
        Ok(fs) => fs,
        Err(Error::NotFound { .. }) => return Ok(Sweep::Missing),
        Err(e) => return Err(e),
    };
    match destroy_locked(graph, fs) {
        Ok(_) => Ok(Sweep::Removed),
        Err(Error::InUse(reason)) => {
            warn!(fs = %id, %reason, "filesystem still has clones, skipped");
            Ok(Sweep::Pinned)
        }
        Err(e) => Err(e),
    }
}

/// remove staging entries older than the grace period
fn sweep_staging(graph: &Graph, dry_run: bool) -> Result<usize> {
    let tmp = graph.tmp_path();
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(&tmp).with_path(&tmp)? {
        let entry = entry.with_path(&tmp)?;
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .with_path(entry.path())?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age < STAGING_GRACE {
            continue;
        }
        if !dry_run {
            remove_path(&entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::test_graph;
    use crate::ops::commit::commit;
    use crate::ops::container::create_container;
    use crate::ops::filesystem::{create_filesystem, filesystem_exists, mount_filesystem};
    use crate::ops::image::ImageBuilder;
    use crate::record::{blob_exists, write_blob};
    use std::fs::File;

    fn committed_layer(graph: &Graph, body: &str) -> Layer {
        let f = create_filesystem(graph, None).unwrap();
        let root = mount_filesystem(graph, &f.id).unwrap();
        fs::write(root.join("f"), body).unwrap();
        commit(graph, &f.id).unwrap()
    }

    fn image_with_file(graph: &Graph) -> crate::types::Image {
        let mut builder = ImageBuilder::new(graph);
        builder
            .step(|root| fs::write(root.join("kept"), "kept").with_path(root))
            .unwrap();
        builder.finish(b"{}").unwrap()
    }

    #[test]
    fn test_gc_keeps_reachable() {
        let (_dir, graph) = test_graph();
        let image = image_with_file(&graph);
        create_container(&graph, &image.id).unwrap();

        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats, GcStats::default());
        assert_eq!(list_layers(&graph).unwrap().len(), 1);
        assert!(blob_exists(&graph, &image.config));
    }

    #[test]
    fn test_gc_removes_unreferenced_layers() {
        let (_dir, graph) = test_graph();
        image_with_file(&graph);
        let loose = committed_layer(&graph, "loose");
        let stray = write_blob(&graph, b"stray").unwrap();

        let stats = gc(&graph, true).unwrap();
        assert_eq!(stats.layers_removed, 1);
        assert_eq!(stats.blobs_removed, 2);
        // dry run touches nothing
        assert_eq!(list_layers(&graph).unwrap().len(), 2);

        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats.layers_removed, 1);
        assert_eq!(stats.filesystems_removed, 1);
        assert_eq!(stats.blobs_removed, 2);
        assert!(!filesystem_exists(&graph, &loose.filesystem).unwrap());
        assert!(!blob_exists(&graph, &stray));
        assert_eq!(list_layers(&graph).unwrap().len(), 1);
    }

    #[test]
    fn test_gc_keeps_layer_whose_filesystem_is_pinned() {
        let (_dir, graph) = test_graph();
        let loose = committed_layer(&graph, "pinned");
        // a backend clone with no record does not keep the layer live
        let stray = FilesystemId::generate();
        graph.backend().create(&stray, Some(&loose.filesystem)).unwrap();

        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats.layers_removed, 0);
        assert_eq!(stats.filesystems_removed, 0);
        assert_eq!(stats.blobs_removed, 0);
        assert_eq!(list_layers(&graph).unwrap(), vec![loose.clone()]);
        assert!(blob_exists(&graph, loose.diff_id.digest()));

        graph.backend().remove(&stray).unwrap();
        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats.layers_removed, 1);
        assert_eq!(stats.filesystems_removed, 1);
        assert!(list_layers(&graph).unwrap().is_empty());
    }

    #[test]
    fn test_gc_removes_orphaned_filesystems() {
        let (_dir, graph) = test_graph();
        let loose = committed_layer(&graph, "orphan");
        // a committed filesystem whose layer record vanished
        delete_record(&graph.layers_path(), &loose.id.digest().to_hex()).unwrap();

        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats.filesystems_removed, 1);
        assert!(!filesystem_exists(&graph, &loose.filesystem).unwrap());
    }

    #[test]
    fn test_gc_sweeps_old_staging_only() {
        let (_dir, graph) = test_graph();
        let old = graph.tmp_file();
        let fresh = graph.tmp_file();
        File::create(&old).unwrap();
        File::create(&fresh).unwrap();
        let past = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let stats = gc(&graph, false).unwrap();
        assert_eq!(stats.staging_removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
