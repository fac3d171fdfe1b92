use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::codec::{compression_for, decompressor, DigestReader};
use super::manifest::{
    Descriptor, Index, Manifest, OciLayout, ANNOTATION_DIFF_ID, ANNOTATION_SIZE, BLOBS_DIR,
    INDEX_FILE, LAYOUT_VERSION, OCI_LAYOUT_FILE,
};
use super::{Distribution, Staging};
use crate::config::Compression;
use crate::error::{Error, IoResultExt, Result};
use crate::graph::Graph;
use crate::hash::{Digest, DigestWriter};
use crate::id::{DiffId, LayerId};
use crate::ops::changeset::apply_changeset;
use crate::ops::commit::commit_archived;
use crate::ops::filesystem::{create_filesystem, discard_filesystem, mount_filesystem};
use crate::ops::image::register_image_locked;
use crate::ops::layer::{find_layer, remove_layer_locked};
use crate::tags::{tag_image, validate_tag_name};
use crate::types::{Image, Layer};

/// json documents larger than this are not accepted from an archive
const MAX_DOCUMENT_SIZE: u64 = 4 * 1024 * 1024;

/// one layer of the archive, verified and decompressed into staging
struct PlannedLayer {
    compression: Compression,
    blob: PathBuf,
    digest: Digest,
    diff_id: DiffId,
    size_bytes: Option<u64>,
    /// where the decompressed changeset is staged
    tar: PathBuf,
}

pub(super) fn load(
    dist: &Distribution,
    graph: &Graph,
    archive: &Path,
    tag: Option<&str>,
) -> Result<Image> {
    if let Some(tag) = tag {
        validate_tag_name(tag)?;
    }
    debug!(archive = %archive.display(), "loading archive");

    let staging = Staging::new(graph)?;
    let extracted = extract(archive, staging.path())?;

    let layout: OciLayout = parse(OCI_LAYOUT_FILE, extracted.document(OCI_LAYOUT_FILE)?)?;
    if layout.image_layout_version != LAYOUT_VERSION {
        return Err(Error::CorruptArchive(format!(
            "unsupported image layout version {}",
            layout.image_layout_version
        )));
    }
    let index: Index = parse(INDEX_FILE, extracted.document(INDEX_FILE)?)?;
    let manifest_descriptor = index
        .manifest()
        .ok_or_else(|| Error::CorruptArchive("index lists no image manifest".to_string()))?;
    let manifest: Manifest = parse("manifest", &extracted.read(manifest_descriptor)?)?;
    if manifest.schema_version != 2 {
        return Err(Error::CorruptArchive(format!(
            "unsupported manifest schema version {}",
            manifest.schema_version
        )));
    }
    if manifest.layers.is_empty() {
        return Err(Error::CorruptArchive("manifest lists no layers".to_string()));
    }
    let config = extracted.read(&manifest.config)?;

    let fallback_diff_ids = config_diff_ids(&config);
    let plan = manifest
        .layers
        .iter()
        .enumerate()
        .map(|(i, descriptor)| {
            plan_layer(
                &extracted,
                descriptor,
                fallback_diff_ids.get(i).copied(),
                staging.path().join(format!("layer-{}.tar", i)),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    dist.run_parallel(&plan, unpack_layer)?;

    let _lock = graph.lock_store()?;
    let mut created = Vec::new();
    let result = materialize(graph, &plan, &mut created)
        .and_then(|layers| register_image_locked(graph, layers, &config));
    let image = match result {
        Ok(image) => image,
        Err(e) => {
            roll_back(graph, &created);
            return Err(e);
        }
    };
    if let Some(tag) = tag {
        tag_image(graph, tag, &image.id)?;
    }

    info!(
        image = %image.id,
        layers = image.layers.len(),
        created = created.len(),
        "loaded image"
    );
    Ok(image)
}

/// archive members that made it through extraction
struct Extracted {
    documents: HashMap<String, Vec<u8>>,
    /// verified blobs: digest -> (staged path, size)
    blobs: HashMap<Digest, (PathBuf, u64)>,
}

impl Extracted {
    fn document(&self, name: &str) -> Result<&[u8]> {
        self.documents
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::CorruptArchive(format!("missing {}", name)))
    }

    /// staged blob a descriptor refers to, size checked
    fn blob(&self, descriptor: &Descriptor) -> Result<&Path> {
        let (path, size) = self.blobs.get(&descriptor.digest).ok_or_else(|| {
            Error::CorruptArchive(format!("blob {} is missing", descriptor.digest))
        })?;
        if *size != descriptor.size {
            return Err(Error::CorruptArchive(format!(
                "blob {} is {} bytes, descriptor says {}",
                descriptor.digest, size, descriptor.size
            )));
        }
        Ok(path)
    }

    fn read(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        if descriptor.size > MAX_DOCUMENT_SIZE {
            return Err(Error::CorruptArchive(format!(
                "document {} is too large",
                descriptor.digest
            )));
        }
        let path = self.blob(descriptor)?;
        fs::read(path).with_path(path)
    }
}

/// unpack the outer tar into `dir`, hashing every blob against its name
fn extract(archive: &Path, dir: &Path) -> Result<Extracted> {
    let file = File::open(archive).with_path(archive)?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    let mut extracted = Extracted {
        documents: HashMap::new(),
        blobs: HashMap::new(),
    };

    for entry in tar.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        let name = entry
            .path()
            .map_err(corrupt)?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();

        if name == OCI_LAYOUT_FILE || name == INDEX_FILE {
            let mut bytes = Vec::new();
            entry
                .by_ref()
                .take(MAX_DOCUMENT_SIZE + 1)
                .read_to_end(&mut bytes)
                .map_err(corrupt)?;
            if bytes.len() as u64 > MAX_DOCUMENT_SIZE {
                return Err(Error::CorruptArchive(format!("{} is too large", name)));
            }
            extracted.documents.insert(name, bytes);
            continue;
        }

        let Some(hex) = name
            .strip_prefix(BLOBS_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            debug!(entry = %name, "ignoring archive entry");
            continue;
        };
        if !kind.is_file() {
            return Err(Error::CorruptArchive(format!("{} is not a regular file", name)));
        }
        let digest = Digest::from_hex(hex)
            .map_err(|_| Error::CorruptArchive(format!("{} is not a blob name", name)))?;

        let dest = dir.join(hex);
        let output = File::create(&dest).with_path(&dest)?;
        let mut writer = DigestWriter::new(BufWriter::new(output));
        io::copy(&mut entry, &mut writer).map_err(corrupt)?;
        let (writer, actual, size) = writer.finish();
        writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_path(&dest)?;
        if actual != digest {
            return Err(Error::CorruptArchive(format!(
                "blob {} hashes to {}",
                digest, actual
            )));
        }
        extracted.blobs.insert(digest, (dest, size));
    }
    Ok(extracted)
}

fn plan_layer(
    extracted: &Extracted,
    descriptor: &Descriptor,
    fallback_diff_id: Option<DiffId>,
    tar: PathBuf,
) -> Result<PlannedLayer> {
    let compression = compression_for(&descriptor.media_type)?;
    let blob = extracted.blob(descriptor)?.to_path_buf();

    let diff_id = match descriptor.annotation(ANNOTATION_DIFF_ID) {
        Some(value) => DiffId::parse(value).map_err(|_| {
            Error::CorruptArchive(format!("layer {} has a malformed diff id", descriptor.digest))
        })?,
        None => fallback_diff_id.ok_or_else(|| {
            Error::CorruptArchive(format!("layer {} has no diff id", descriptor.digest))
        })?,
    };
    let size_bytes = descriptor
        .annotation(ANNOTATION_SIZE)
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                Error::CorruptArchive(format!("layer {} has a malformed size", descriptor.digest))
            })
        })
        .transpose()?;

    Ok(PlannedLayer {
        compression,
        blob,
        digest: descriptor.digest,
        diff_id,
        size_bytes,
        tar,
    })
}

/// diff ids from a standard OCI image config, for archives written by
/// other tools
fn config_diff_ids(config: &[u8]) -> Vec<DiffId> {
    #[derive(Deserialize)]
    struct RootFs {
        #[serde(default)]
        diff_ids: Vec<DiffId>,
    }
    #[derive(Deserialize)]
    struct ImageConfig {
        rootfs: Option<RootFs>,
    }

    serde_json::from_slice::<ImageConfig>(config)
        .ok()
        .and_then(|c| c.rootfs)
        .map(|r| r.diff_ids)
        .unwrap_or_default()
}

/// decompress a layer into staging and check it hashes to its diff id
fn unpack_layer(layer: &PlannedLayer) -> Result<()> {
    let input = File::open(&layer.blob).with_path(&layer.blob)?;
    let decoded = decompressor(layer.compression, BufReader::new(input)).map_err(corrupt)?;
    let mut reader = DigestReader::new(decoded);

    let output = File::create(&layer.tar).with_path(&layer.tar)?;
    let mut writer = BufWriter::new(output);
    io::copy(&mut reader, &mut writer).map_err(|e| {
        Error::CorruptArchive(format!("layer {} does not decompress: {}", layer.digest, e))
    })?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_path(&layer.tar)?;

    let (actual, _) = reader.finish();
    if actual != *layer.diff_id.digest() {
        return Err(Error::CorruptArchive(format!(
            "layer {} decompresses to {}, expected {}",
            layer.digest, actual, layer.diff_id
        )));
    }
    debug!(diff_id = %layer.diff_id, "unpacked layer");
    Ok(())
}

/// apply the planned layers base first, reusing layers already stored
///
/// ids of layers this call created are pushed to `created` as they appear.
fn materialize(
    graph: &Graph,
    plan: &[PlannedLayer],
    created: &mut Vec<LayerId>,
) -> Result<Vec<LayerId>> {
    let mut chain = Vec::with_capacity(plan.len());
    let mut parent: Option<Layer> = None;

    for planned in plan {
        let parent_id = parent.as_ref().map(|l| l.id);
        let layer = match find_layer(graph, &planned.diff_id, parent_id.as_ref())? {
            Some(existing) => {
                debug!(layer = %existing.id, "layer already stored");
                existing
            }
            None => {
                let (layer, fresh) = apply_layer(graph, parent.as_ref(), planned)?;
                if fresh {
                    created.push(layer.id);
                }
                if let Some(expected) = planned.size_bytes {
                    if expected != layer.size_bytes {
                        warn!(
                            layer = %layer.id,
                            expected,
                            actual = layer.size_bytes,
                            "layer size differs from archive"
                        );
                    }
                }
                layer
            }
        };
        chain.push(layer.id);
        parent = Some(layer);
    }
    Ok(chain)
}

/// materialize one layer on a clone of `parent`
///
/// the flag is false when a concurrent commit stored the same layer first.
fn apply_layer(
    graph: &Graph,
    parent: Option<&Layer>,
    planned: &PlannedLayer,
) -> Result<(Layer, bool)> {
    let fs = create_filesystem(graph, parent.map(|l| &l.filesystem))?;
    let result = mount_filesystem(graph, &fs.id)
        .and_then(|root| {
            let tar = File::open(&planned.tar).with_path(&planned.tar)?;
            apply_changeset(BufReader::new(tar), &root)
        })
        .and_then(|_| commit_archived(graph, &fs.id, planned.diff_id, &planned.tar));
    match result {
        Ok(layer) => {
            let fresh = layer.filesystem == fs.id;
            Ok((layer, fresh))
        }
        Err(e) => {
            discard_filesystem(graph, &fs.id);
            Err(e)
        }
    }
}

/// remove layers a failed load created, newest first
fn roll_back(graph: &Graph, created: &[LayerId]) {
    for id in created.iter().rev() {
        match remove_layer_locked(graph, id) {
            Ok(_) => debug!(layer = %id, "rolled back layer"),
            Err(e) => warn!(layer = %id, error = %e, "failed to roll back layer"),
        }
    }
}

fn parse<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::CorruptArchive(format!("malformed {}: {}", what, e)))
}

fn corrupt(e: io::Error) -> Error {
    Error::CorruptArchive(e.to_string())
}
