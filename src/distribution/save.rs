use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use super::codec::{compress, media_type, DigestReader};
use super::manifest::{
    Descriptor, Index, Manifest, OciLayout, ANNOTATION_DIFF_ID, ANNOTATION_IMAGE_ID,
    ANNOTATION_SIZE, BLOBS_DIR, INDEX_FILE, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST,
    OCI_LAYOUT_FILE,
};
use super::{Distribution, Staging};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::graph::Graph;
use crate::hash::{digest_bytes, Digest, DigestWriter};
use crate::id::ImageId;
use crate::ops::{image, layer, layer_blob_path};
use crate::record::read_blob;
use crate::types::Layer;

/// summary of a written archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArchive {
    pub image: ImageId,
    /// digest of the manifest inside the archive
    pub manifest: Digest,
    pub layers: usize,
    /// size of the archive file
    pub size: u64,
}

/// a compressed layer staged for the archive
struct PackedLayer {
    path: PathBuf,
    digest: Digest,
    size: u64,
}

pub(super) fn save(
    dist: &Distribution,
    graph: &Graph,
    id: &ImageId,
    dest: &Path,
) -> Result<SavedArchive> {
    let image = image(graph, id)?;
    let layers = image
        .layers
        .iter()
        .map(|l| layer(graph, l))
        .collect::<Result<Vec<_>>>()?;
    let config = read_blob(graph, &image.config)?;
    debug!(image = %id, layers = layers.len(), dest = %dest.display(), "saving image");

    let staging = Staging::new(graph)?;
    let packed = dist.run_parallel(&layers, |layer| {
        pack_layer(dist, graph, layer, staging.path())
    })?;

    let layer_type = media_type(dist.config().compression);
    let descriptors = layers
        .iter()
        .zip(&packed)
        .map(|(layer, packed)| {
            Descriptor::new(layer_type, packed.digest, packed.size)
                .with_annotation(ANNOTATION_DIFF_ID, layer.diff_id)
                .with_annotation(ANNOTATION_SIZE, layer.size_bytes)
        })
        .collect();
    let config_descriptor = Descriptor::new(MEDIA_TYPE_CONFIG, image.config, config.len() as u64);
    let manifest = serde_json::to_vec(&Manifest::new(config_descriptor, descriptors))?;
    let manifest_digest = digest_bytes(&manifest);
    let index = Index::new(vec![Descriptor::new(
        MEDIA_TYPE_MANIFEST,
        manifest_digest,
        manifest.len() as u64,
    )
    .with_annotation(ANNOTATION_IMAGE_ID, image.id)]);

    let layout = serde_json::to_vec(&OciLayout::default())?;
    let index = serde_json::to_vec(&index)?;
    let documents = [
        (OCI_LAYOUT_FILE.to_string(), &layout[..]),
        (INDEX_FILE.to_string(), &index[..]),
        (blob_name(&manifest_digest), &manifest[..]),
        (blob_name(&image.config), &config[..]),
    ];

    let partial = partial_path(dest)?;
    let size = match write_archive(&partial, &documents, &packed) {
        Ok(size) => size,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&partial, dest) {
        let _ = fs::remove_file(&partial);
        return Err(Error::Io {
            path: dest.to_path_buf(),
            source: e,
        });
    }
    fsync_dir(parent_dir(dest))?;

    info!(image = %id, layers = layers.len(), size, dest = %dest.display(), "saved image");
    Ok(SavedArchive {
        image: image.id,
        manifest: manifest_digest,
        layers: layers.len(),
        size,
    })
}

/// compress one layer blob into `dir`, checking it still hashes to its diff id
fn pack_layer(dist: &Distribution, graph: &Graph, layer: &Layer, dir: &Path) -> Result<PackedLayer> {
    let source = layer_blob_path(graph, layer);
    let input = File::open(&source).with_path(&source)?;
    let mut reader = DigestReader::new(BufReader::new(input));

    // named by layer id: two layers of one image may share a diff id
    let path = dir.join(layer.id.digest().to_hex());
    let output = File::create(&path).with_path(&path)?;
    let config = dist.config();
    let writer = compress(
        config.compression,
        config.level,
        &mut reader,
        DigestWriter::new(BufWriter::new(output)),
    )
    .with_path(&path)?;
    let (writer, digest, size) = writer.finish();
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_path(&path)?;

    let (diff_id, _) = reader.finish();
    if diff_id != *layer.diff_id.digest() {
        return Err(Error::InvalidState(format!(
            "blob of layer {} is corrupt",
            layer.id.short()
        )));
    }
    debug!(layer = %layer.id, compressed = size, "packed layer");
    Ok(PackedLayer { path, digest, size })
}

/// write the outer tar to `path`, returning its size
fn write_archive(path: &Path, documents: &[(String, &[u8])], layers: &[PackedLayer]) -> Result<u64> {
    let file = File::create(path).with_path(path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    append_dir(&mut builder, "blobs").with_path(path)?;
    append_dir(&mut builder, BLOBS_DIR).with_path(path)?;
    for (name, bytes) in documents {
        append_file(&mut builder, name, bytes.len() as u64, *bytes).with_path(path)?;
    }

    let mut written = HashSet::new();
    for layer in layers {
        if !written.insert(layer.digest) {
            continue;
        }
        let blob = File::open(&layer.path).with_path(&layer.path)?;
        append_file(&mut builder, &blob_name(&layer.digest), layer.size, BufReader::new(blob))
            .with_path(path)?;
    }

    let writer = builder.into_inner().with_path(path)?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_path(path)?;
    file.sync_all().with_path(path)?;
    Ok(file.metadata().with_path(path)?.len())
}

fn append_file<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, name, data)
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, format!("{}/", name), io::empty())
}

pub(super) fn blob_name(digest: &Digest) -> String {
    format!("{}/{}", BLOBS_DIR, digest.to_hex())
}

/// `<dest>.<uuid>.partial`, next to `dest` so the final rename stays on
/// one filesystem
fn partial_path(dest: &Path) -> Result<PathBuf> {
    let name = dest.file_name().ok_or_else(|| {
        Error::InvalidState(format!("{} does not name a file", dest.display()))
    })?;
    let mut partial = OsString::from(name);
    partial.push(format!(".{}.partial", Uuid::new_v4()));
    Ok(dest.with_file_name(partial))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
