//! changeset tar streams
//!
//! a changeset serializes as a tar of every added or modified entry, in
//! path order, with mtime zeroed so equal changes give equal bytes. a
//! deleted path becomes an empty `.wh.<name>` entry next to it, unless an
//! ancestor is deleted too.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_metadata, create_special, create_symlink, read_symlink_target, remove_path,
    FileMetadata,
};
use crate::hash::DigestWriter;
use crate::id::DiffId;
use crate::ops::diff::tree_path;
use crate::types::{ChangeKind, Changeset, EntryType};

/// prefix marking a deleted sibling
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// marks a directory whose lower contents are all hidden
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// write `changeset` as a tar, reading entries from `root`
pub fn write_changeset<W: Write>(root: &Path, changeset: &Changeset, out: W) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    for change in changeset.changes() {
        let name = change.path.trim_start_matches('/');

        if change.kind == ChangeKind::Deleted {
            if changeset.has_deleted_ancestor(&change.path) {
                continue;
            }
            let whiteout = whiteout_name(name);
            let mut header = base_header(tar::EntryType::Regular, 0o644, 0, 0);
            builder
                .append_data(&mut header, &whiteout, io::empty())
                .with_path(&whiteout)?;
            continue;
        }

        let path = tree_path(root, &change.path);
        let meta = FileMetadata::from_path(&path)?;
        match meta.entry {
            EntryType::Regular => {
                let mut header = base_header(tar::EntryType::Regular, meta.mode, meta.uid, meta.gid);
                header.set_size(meta.size);
                let file = File::open(&path).with_path(&path)?;
                builder.append_data(&mut header, name, file).with_path(&path)?;
            }
            EntryType::Directory => {
                let mut header = base_header(tar::EntryType::Directory, meta.mode, meta.uid, meta.gid);
                builder.append_data(&mut header, name, io::empty()).with_path(&path)?;
            }
            EntryType::Symlink => {
                let target = read_symlink_target(&path)?;
                let mut header = base_header(tar::EntryType::Symlink, 0o777, meta.uid, meta.gid);
                builder.append_link(&mut header, name, &target).with_path(&path)?;
            }
            EntryType::BlockDevice | EntryType::CharDevice | EntryType::Fifo => {
                let kind = match meta.entry {
                    EntryType::BlockDevice => tar::EntryType::Block,
                    EntryType::CharDevice => tar::EntryType::Char,
                    _ => tar::EntryType::Fifo,
                };
                let mut header = base_header(kind, meta.mode, meta.uid, meta.gid);
                header
                    .set_device_major(nix::sys::stat::major(meta.rdev) as u32)
                    .with_path(&path)?;
                header
                    .set_device_minor(nix::sys::stat::minor(meta.rdev) as u32)
                    .with_path(&path)?;
                builder.append_data(&mut header, name, io::empty()).with_path(&path)?;
            }
            EntryType::Socket => {
                // sockets belong to a running process, tar cannot carry them
                debug!(path = %change.path, "skipping socket");
            }
        }
    }

    builder.into_inner().with_path("<changeset tar>")
}

/// serialize `changeset` to `dest`, returning its diff id and length
pub fn write_changeset_file(root: &Path, changeset: &Changeset, dest: &Path) -> Result<(DiffId, u64)> {
    let file = File::create(dest).with_path(dest)?;
    let writer = DigestWriter::new(BufWriter::new(file));
    let writer = write_changeset(root, changeset, writer)?;
    let (buffered, digest, size) = writer.finish();
    let file = buffered.into_inner().map_err(|e| Error::Io {
        path: dest.to_path_buf(),
        source: e.into_error(),
    })?;
    file.sync_all().with_path(dest)?;
    Ok((DiffId::from_digest(digest), size))
}

fn base_header(kind: tar::EntryType, mode: u32, uid: u32, gid: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode & 0o7777);
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));
    header.set_mtime(0);
    header.set_size(0);
    header
}

fn whiteout_name(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((dir, base)) => format!("{}/{}{}", dir, WHITEOUT_PREFIX, base),
        None => format!("{}{}", WHITEOUT_PREFIX, name),
    }
}

/// counts from applying one changeset
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub entries: usize,
    pub whiteouts: usize,
}

/// apply a changeset (or any layer tar) on top of the tree at `root`
///
/// whiteouts delete, everything else replaces what is at its path.
/// ownership is only restored when running as root.
pub fn apply_changeset<R: Read>(reader: R, root: &Path) -> Result<ApplyStats> {
    let mut archive = tar::Archive::new(reader);
    let mut stats = ApplyStats::default();
    let mut dirs = Vec::new();

    let entries = archive.entries().map_err(corrupt)?;
    for entry in entries {
        let mut entry = entry.map_err(corrupt)?;
        let rel = sanitize(&entry.path().map_err(corrupt)?)?;
        let Some(rel) = rel else {
            continue;
        };
        check_ancestors(root, &rel)?;
        let target = root.join(&rel);
        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = target.parent().unwrap_or(root);
            if dir.is_dir() {
                for child in fs::read_dir(dir).with_path(dir)? {
                    remove_path(&child.with_path(dir)?.path())?;
                }
            }
            stats.whiteouts += 1;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&target.with_file_name(hidden))?;
            stats.whiteouts += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            if !parent.is_dir() {
                remove_path(parent)?;
                fs::create_dir_all(parent).with_path(parent)?;
            }
        }

        let header = entry.header();
        let mode = header.mode().map_err(corrupt)?;
        let uid = header.uid().map_err(corrupt)? as u32;
        let gid = header.gid().map_err(corrupt)? as u32;
        let kind = header.entry_type();

        let existing = fs::symlink_metadata(&target).ok();
        let keep_dir = kind.is_dir() && existing.as_ref().is_some_and(|m| m.is_dir());
        if existing.is_some() && !keep_dir {
            remove_path(&target)?;
        }

        let entry_type = match kind {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut file = File::create(&target).with_path(&target)?;
                io::copy(&mut entry, &mut file).with_path(&target)?;
                EntryType::Regular
            }
            tar::EntryType::Directory => {
                if !keep_dir {
                    fs::create_dir(&target).with_path(&target)?;
                }
                // final mode once children are written
                dirs.push((target, uid, gid, mode));
                stats.entries += 1;
                continue;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| Error::CorruptArchive(format!("symlink {} has no target", rel.display())))?;
                create_symlink(&target, &link.to_string_lossy())?;
                EntryType::Symlink
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| Error::CorruptArchive(format!("hardlink {} has no target", rel.display())))?;
                let source = sanitize(&link)?
                    .ok_or_else(|| Error::CorruptArchive(format!("bad hardlink target for {}", rel.display())))?;
                check_ancestors(root, &source)?;
                let source = root.join(source);
                fs::hard_link(&source, &target).with_path(&target)?;
                stats.entries += 1;
                continue;
            }
            tar::EntryType::Block | tar::EntryType::Char | tar::EntryType::Fifo => {
                let major = header.device_major().map_err(corrupt)?.unwrap_or(0);
                let minor = header.device_minor().map_err(corrupt)?.unwrap_or(0);
                let rdev = nix::sys::stat::makedev(u64::from(major), u64::from(minor));
                let entry_type = match kind {
                    tar::EntryType::Block => EntryType::BlockDevice,
                    tar::EntryType::Char => EntryType::CharDevice,
                    _ => EntryType::Fifo,
                };
                create_special(&target, entry_type, mode, rdev as u64)?;
                entry_type
            }
            other => {
                debug!(path = %rel.display(), kind = ?other, "skipping unsupported tar entry");
                continue;
            }
        };
        apply_metadata(&target, entry_type, uid, gid, mode)?;
        stats.entries += 1;
    }

    for (dir, uid, gid, mode) in dirs.into_iter().rev() {
        // a later member may have replaced the directory
        let still_dir = fs::symlink_metadata(&dir).is_ok_and(|m| m.is_dir());
        if still_dir {
            apply_metadata(&dir, EntryType::Directory, uid, gid, mode)?;
        }
    }
    Ok(stats)
}

/// refuse a member whose existing ancestors inside `root` include a symlink
///
/// following one would let a layer write, delete or link files outside
/// the tree it is applied to.
fn check_ancestors(root: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::CorruptArchive(format!(
                    "tar member {} passes through symlink {}",
                    rel.display(),
                    current.strip_prefix(root).unwrap_or(&current).display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(Error::Io { path: current, source: e }),
        }
    }
    Ok(())
}

/// in-tree relative path of a tar member; `None` for the root itself
fn sanitize(path: &Path) -> Result<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::CorruptArchive(format!(
                    "tar member escapes the tree: {}",
                    path.display()
                )))
            }
        }
    }
    Ok((!clean.as_os_str().is_empty()).then_some(clean))
}

fn corrupt(e: io::Error) -> Error {
    Error::CorruptArchive(format!("bad changeset tar: {}", e))
}
