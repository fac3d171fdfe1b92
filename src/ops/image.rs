use std::io::Read;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::id::{ImageId, LayerId};
use crate::ops::changeset::apply_changeset;
use crate::ops::commit::commit;
use crate::ops::container::containers_using_image;
use crate::ops::filesystem::{
    create_filesystem, create_filesystem_from_layer, discard_filesystem, mount_filesystem,
};
use crate::ops::layer::{layer, remove_layer_locked};
use crate::record::{
    delete_record, list_records, read_blob, read_record, record_exists, remove_blob, write_blob,
    write_record,
};
use crate::tags::{tags_for_image, untag};
use crate::types::{Image, Layer};

fn image_key(id: &ImageId) -> String {
    id.digest().to_hex()
}

/// register an image over a committed layer chain, base first
///
/// each layer must sit directly on the one before it. registering the
/// same chain and config twice returns the existing image.
pub fn register_image(graph: &Graph, layers: Vec<LayerId>, config: &[u8]) -> Result<Image> {
    let _lock = graph.lock_store()?;
    register_image_locked(graph, layers, config)
}

pub(crate) fn register_image_locked(
    graph: &Graph,
    layers: Vec<LayerId>,
    config: &[u8],
) -> Result<Image> {
    if layers.is_empty() {
        return Err(Error::InvalidState("an image needs at least one layer".to_string()));
    }
    let mut expected_parent = None;
    for id in &layers {
        let layer = layer(graph, id)?;
        if layer.parent != expected_parent {
            return Err(Error::InvalidState(format!(
                "layer {} does not sit on {}",
                id.short(),
                expected_parent.map(|p| p.short()).unwrap_or_else(|| "an empty tree".to_string())
            )));
        }
        expected_parent = Some(*id);
    }

    let config_digest = write_blob(graph, config)?;
    let image = Image::new(layers, config_digest);
    let key = image_key(&image.id);
    if record_exists(&graph.images_path(), &key) {
        debug!(image = %image.id, "image already registered");
        return read_record(&graph.images_path(), &key, "image");
    }

    write_record(graph, &graph.images_path(), &key, &image)?;
    info!(image = %image.id, layers = image.layers.len(), "registered image");
    Ok(image)
}

/// read an image record
pub fn image(graph: &Graph, id: &ImageId) -> Result<Image> {
    read_record(&graph.images_path(), &image_key(id), "image")
}

pub fn image_exists(graph: &Graph, id: &ImageId) -> bool {
    record_exists(&graph.images_path(), &image_key(id))
}

/// all images, ordered by id
pub fn list_images(graph: &Graph) -> Result<Vec<Image>> {
    let mut images = Vec::new();
    for name in list_records(&graph.images_path())? {
        images.push(image(graph, &ImageId::parse(&name)?)?);
    }
    Ok(images)
}

/// the opaque config blob an image was registered with
pub fn image_config(graph: &Graph, id: &ImageId) -> Result<Vec<u8>> {
    let image = image(graph, id)?;
    read_blob(graph, &image.config)
}

/// delete an image, its tags, and the layers only it kept alive
///
/// layers are pruned top-down and pruning stops at the first layer still
/// needed elsewhere. returns the removed layers.
pub fn remove_image(graph: &Graph, id: &ImageId) -> Result<Vec<Layer>> {
    let _lock = graph.lock_store()?;
    let image = image(graph, id)?;

    if let Some(container) = containers_using_image(graph, id)?.first() {
        return Err(Error::InUse(format!(
            "image {} is used by container {}",
            id.short(),
            container.id.short()
        )));
    }

    for tag in tags_for_image(graph, id)? {
        untag(graph, &tag)?;
    }
    delete_record(&graph.images_path(), &image_key(id))?;
    info!(image = %id, "removed image");

    let mut removed = Vec::new();
    for layer_id in image.layers.iter().rev() {
        match remove_layer_locked(graph, layer_id) {
            Ok(layer) => removed.push(layer),
            Err(Error::InUse(reason)) => {
                debug!(layer = %layer_id, %reason, "layer still in use, pruning stops");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let config_shared = list_images(graph)?.iter().any(|i| i.config == image.config);
    if !config_shared {
        remove_blob(graph, &image.config)?;
    }
    Ok(removed)
}

/// builds an image one layer at a time
///
/// each step clones a fresh filesystem from the current top layer, lets
/// the closure mutate its tree and commits it. layers committed by earlier
/// steps are never touched again.
pub struct ImageBuilder<'g> {
    graph: &'g Graph,
    layers: Vec<LayerId>,
}

impl<'g> ImageBuilder<'g> {
    /// start from an empty tree
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            layers: Vec::new(),
        }
    }

    /// start on top of an existing image's layers
    pub fn from_image(graph: &'g Graph, id: &ImageId) -> Result<Self> {
        let image = image(graph, id)?;
        Ok(Self {
            graph,
            layers: image.layers,
        })
    }

    /// run `build` against a new filesystem and commit it as the next layer
    ///
    /// when `build` or the commit fails the filesystem is discarded and
    /// the builder is left as it was.
    pub fn step<F>(&mut self, build: F) -> Result<Layer>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let fs = match self.layers.last() {
            Some(top) => create_filesystem_from_layer(self.graph, top)?,
            None => create_filesystem(self.graph, None)?,
        };

        let result = mount_filesystem(self.graph, &fs.id)
            .and_then(|root| build(&root))
            .and_then(|()| commit(self.graph, &fs.id));
        match result {
            Ok(layer) => {
                self.layers.push(layer.id);
                Ok(layer)
            }
            Err(e) => {
                discard_filesystem(self.graph, &fs.id);
                Err(e)
            }
        }
    }

    /// layers committed so far, base first
    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }

    /// register the built chain as an image
    pub fn finish(self, config: &[u8]) -> Result<Image> {
        register_image(self.graph, self.layers, config)
    }
}

/// create a single-layer base image from a rootfs tarball
pub fn import_tar<R: Read>(graph: &Graph, reader: R, config: &[u8]) -> Result<Image> {
    let mut builder = ImageBuilder::new(graph);
    builder.step(|root| apply_changeset(reader, root).map(|_| ()))?;
    builder.finish(config)
}
