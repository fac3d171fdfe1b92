//! metadata records and the blob store
//!
//! records (filesystems, layers, images, containers) are CBOR, zstd
//! compressed, one file per id. blobs are raw bytes named by their sha256.
//! every write goes to tmp/ first and is renamed into place, so a reader
//! sees either the old file or the complete new one.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::graph::Graph;
use crate::hash::{digest_bytes, digest_file, Digest};

const ZSTD_LEVEL: i32 = 3;

/// atomic write: temp -> fsync -> rename -> fsync dir
pub(crate) fn write_atomic(graph: &Graph, dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = graph.tmp_file();
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        tmp_file.write_all(bytes).with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }
    publish(&tmp_path, dest)
}

/// rename a synced staging file into place and sync the parent directory
pub(crate) fn publish(tmp_path: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    fs::rename(tmp_path, dest).with_path(dest)?;
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// serialize `value` into the record file `dir/name`, replacing any old one
pub(crate) fn write_record<T: Serialize>(
    graph: &Graph,
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<()> {
    let mut cbor_bytes = Vec::new();
    ciborium::into_writer(value, &mut cbor_bytes)?;

    let compressed = zstd::encode_all(&cbor_bytes[..], ZSTD_LEVEL).map_err(|e| Error::Io {
        path: PathBuf::from("<zstd>"),
        source: e,
    })?;

    write_atomic(graph, &dir.join(name), &compressed)
}

/// read the record `dir/name`; `NotFound` names `kind`
pub(crate) fn read_record<T: DeserializeOwned>(
    dir: &Path,
    name: &str,
    kind: &'static str,
) -> Result<T> {
    let path = dir.join(name);
    let compressed = fs::read(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::not_found(kind, name)
        } else {
            Error::Io {
                path: path.clone(),
                source: e,
            }
        }
    })?;

    let cbor_bytes = zstd::decode_all(&compressed[..]).with_path(&path)?;
    let value = ciborium::from_reader(&cbor_bytes[..])?;
    Ok(value)
}

pub(crate) fn record_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

/// delete a record; false if it did not exist
pub(crate) fn delete_record(dir: &Path, name: &str) -> Result<bool> {
    let path = dir.join(name);
    match fs::remove_file(&path) {
        Ok(()) => {
            fsync_dir(dir)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

/// names of all records in `dir`, sorted
pub(crate) fn list_records(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        if entry.file_type().with_path(entry.path())?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// get the filesystem path to a blob
pub fn blob_path(graph: &Graph, digest: &Digest) -> PathBuf {
    graph.blobs_path().join(digest.to_hex())
}

pub fn blob_exists(graph: &Graph, digest: &Digest) -> bool {
    blob_path(graph, digest).is_file()
}

/// move a synced staging file into the blob store under `digest`
///
/// the caller computed `digest` while writing `tmp_path`. an existing blob
/// with that digest wins and the staging file is dropped.
pub(crate) fn store_blob(graph: &Graph, tmp_path: &Path, digest: &Digest) -> Result<PathBuf> {
    let dest = blob_path(graph, digest);
    if dest.exists() {
        fs::remove_file(tmp_path).with_path(tmp_path)?;
    } else {
        publish(tmp_path, &dest)?;
    }
    Ok(dest)
}

/// write a small blob from memory
pub fn write_blob(graph: &Graph, bytes: &[u8]) -> Result<Digest> {
    let digest = digest_bytes(bytes);
    if !blob_exists(graph, &digest) {
        write_atomic(graph, &blob_path(graph, &digest), bytes)?;
    }
    Ok(digest)
}

/// read a blob, verifying its digest
pub fn read_blob(graph: &Graph, digest: &Digest) -> Result<Vec<u8>> {
    let path = blob_path(graph, digest);
    let mut bytes = Vec::new();
    File::open(&path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::not_found("blob", digest)
            } else {
                Error::Io {
                    path: path.clone(),
                    source: e,
                }
            }
        })?
        .read_to_end(&mut bytes)
        .with_path(&path)?;

    if digest_bytes(&bytes) != *digest {
        return Err(Error::InvalidState(format!("blob {} is corrupt", digest)));
    }
    Ok(bytes)
}

/// recompute a stored blob's digest and size
pub(crate) fn hash_blob(graph: &Graph, digest: &Digest) -> Result<(Digest, u64)> {
    digest_file(&blob_path(graph, digest))
}

/// digests of every stored blob
pub(crate) fn list_blobs(graph: &Graph) -> Result<Vec<Digest>> {
    let mut digests = Vec::new();
    for name in list_records(&graph.blobs_path())? {
        if let Ok(digest) = Digest::from_hex(&name) {
            digests.push(digest);
        }
    }
    Ok(digests)
}

pub(crate) fn remove_blob(graph: &Graph, digest: &Digest) -> Result<bool> {
    delete_record(&graph.blobs_path(), &digest.to_hex())
}
