use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{lchown, symlink, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{mknod, Mode, SFlag};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::read::{read_symlink_target, FileMetadata};
use crate::fs::is_backend_metadata;
use crate::types::EntryType;

/// true if the current process may set arbitrary ownership
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// create a symlink, replacing whatever is at `path`
pub fn create_symlink(path: &Path, target: &str) -> Result<()> {
    remove_path(path)?;
    symlink(target, path).with_path(path)
}

/// create a fifo, device node or socket node
///
/// devices need CAP_MKNOD; without it the error surfaces as an io error
/// on `path`.
pub fn create_special(path: &Path, entry: EntryType, mode: u32, rdev: u64) -> Result<()> {
    let kind = match entry {
        EntryType::Fifo => SFlag::S_IFIFO,
        EntryType::BlockDevice => SFlag::S_IFBLK,
        EntryType::CharDevice => SFlag::S_IFCHR,
        EntryType::Socket => SFlag::S_IFSOCK,
        other => {
            return Err(Error::InvalidState(format!(
                "{:?} is not a special file type",
                other
            )))
        }
    };
    remove_path(path)?;
    mknod(path, kind, Mode::from_bits_truncate(mode & 0o7777), rdev as nix::libc::dev_t)
        .map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: io::Error::from(e),
        })
}

/// set ownership (when privileged) then permission bits
///
/// symlinks keep their 0777 mode; only their ownership is touched.
pub fn apply_metadata(path: &Path, entry: EntryType, uid: u32, gid: u32, mode: u32) -> Result<()> {
    if is_root() {
        lchown(path, Some(uid), Some(gid)).with_path(path)?;
    }
    if entry != EntryType::Symlink {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)?;
    }
    Ok(())
}

/// remove a file, symlink or whole directory tree; missing paths are fine
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    };
    if meta.is_dir() {
        make_writable(path)?;
        fs::remove_dir_all(path).with_path(path)
    } else {
        fs::remove_file(path).with_path(path)
    }
}

/// give the owner write access on every directory under `root`, so a tree
/// holding read-only directories can be deleted
fn make_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_dir() {
            let meta = entry.metadata().map_err(walk_error)?;
            let mode = meta.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(entry.path(), Permissions::from_mode(mode | 0o700))
                    .with_path(entry.path())?;
            }
        }
    }
    Ok(())
}

/// recursively copy `src` into `dst`, preserving types, modes, symlinks,
/// device numbers and (when privileged) ownership
///
/// `dst` must not exist. backend metadata at the root of `src` is skipped.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut dirs = Vec::new();

    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && is_backend_metadata(e.file_name())));

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dst.join(rel);
        let meta = FileMetadata::from_path(entry.path())?;

        match meta.entry {
            EntryType::Directory => {
                // final mode is applied bottom-up once children exist
                fs::create_dir(&target).with_path(&target)?;
                dirs.push((target, meta));
                continue;
            }
            EntryType::Regular => {
                fs::copy(entry.path(), &target).with_path(&target)?;
            }
            EntryType::Symlink => {
                let link = read_symlink_target(entry.path())?;
                symlink(&link, &target).with_path(&target)?;
            }
            special => create_special(&target, special, meta.mode, meta.rdev)?,
        }
        apply_metadata(&target, meta.entry, meta.uid, meta.gid, meta.mode)?;
    }

    for (path, meta) in dirs.into_iter().rev() {
        apply_metadata(&path, meta.entry, meta.uid, meta.gid, meta.mode)?;
    }
    Ok(())
}

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

pub(crate) fn walk_error(e: walkdir::Error) -> Error {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    Error::Io {
        path,
        source: e
            .into_io_error()
            .unwrap_or_else(|| io::Error::other("filesystem loop")),
    }
}
