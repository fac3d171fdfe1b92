use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{BufReader, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{IoResultExt, Result};
use crate::fs::is_backend_metadata;
use crate::fs::write::walk_error;
use crate::types::EntryType;

/// detect entry type from metadata (does not follow symlinks)
pub fn entry_type(meta: &Metadata) -> EntryType {
    let ft = meta.file_type();
    if ft.is_file() {
        EntryType::Regular
    } else if ft.is_dir() {
        EntryType::Directory
    } else if ft.is_symlink() {
        EntryType::Symlink
    } else if ft.is_block_device() {
        EntryType::BlockDevice
    } else if ft.is_char_device() {
        EntryType::CharDevice
    } else if ft.is_fifo() {
        EntryType::Fifo
    } else {
        EntryType::Socket
    }
}

/// metadata for a filesystem entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub entry: EntryType,
    pub uid: u32,
    pub gid: u32,
    /// permission bits only (no file type bits)
    pub mode: u32,
    pub size: u64,
    /// raw device number for block/char devices
    pub rdev: u64,
}

impl FileMetadata {
    /// read metadata from path (does not follow symlinks)
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    pub fn from_std_metadata(meta: &Metadata) -> Self {
        let entry = entry_type(meta);
        let rdev = match entry {
            EntryType::BlockDevice | EntryType::CharDevice => meta.rdev(),
            _ => 0,
        };
        Self {
            entry,
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
            size: meta.len(),
            rdev,
        }
    }

    /// size counted toward a layer: regular file length, 0 for everything else
    pub fn content_size(&self) -> u64 {
        if self.entry == EntryType::Regular {
            self.size
        } else {
            0
        }
    }
}

/// read symlink target
pub fn read_symlink_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    Ok(target.to_string_lossy().into_owned())
}

/// every entry below `root`, keyed by absolute in-tree path (`/etc/hosts`)
///
/// the root itself is keyed `/`. backend metadata at the root is skipped.
pub fn scan_tree(root: &Path) -> Result<BTreeMap<String, FileMetadata>> {
    let mut entries = BTreeMap::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && is_backend_metadata(e.file_name())));

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = entry.path().strip_prefix(root).unwrap_or(Path::new(""));
        let key = format!("/{}", rel.to_string_lossy());
        let meta = entry.metadata().map_err(walk_error)?;
        entries.insert(key, FileMetadata::from_std_metadata(&meta));
    }
    Ok(entries)
}

/// compare two regular files byte for byte
pub fn contents_equal(a: &Path, b: &Path) -> Result<bool> {
    let mut ra = BufReader::new(File::open(a).with_path(a)?);
    let mut rb = BufReader::new(File::open(b).with_path(b)?);
    let mut buf_a = [0u8; 64 * 1024];
    let mut buf_b = [0u8; 64 * 1024];

    loop {
        let n = read_full(&mut ra, &mut buf_a).with_path(a)?;
        let m = read_full(&mut rb, &mut buf_b).with_path(b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

/// read until `buf` is full or eof
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;

    #[test]
    fn test_entry_type_regular() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, "content").unwrap();

        let meta = FileMetadata::from_path(&path).unwrap();
        assert_eq!(meta.entry, EntryType::Regular);
        assert_eq!(meta.size, 7);
        assert_eq!(meta.content_size(), 7);
    }

    #[test]
    fn test_entry_type_directory() {
        let dir = tempdir().unwrap();
        let subdir = dir.path().join("subdir");
        fs::create_dir(&subdir).unwrap();

        let meta = FileMetadata::from_path(&subdir).unwrap();
        assert_eq!(meta.entry, EntryType::Directory);
        assert_eq!(meta.content_size(), 0);
    }

    #[test]
    fn test_entry_type_symlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "content").unwrap();
        symlink(&target, &link).unwrap();

        let meta = FileMetadata::from_path(&link).unwrap();
        assert_eq!(meta.entry, EntryType::Symlink);
    }

    #[test]
    fn test_metadata_mode_strips_type_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, "content").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        let meta = FileMetadata::from_path(&path).unwrap();
        assert_eq!(meta.mode, 0o640);
    }

    #[test]
    fn test_read_symlink_target() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        symlink("/some/target/path", &link).unwrap();

        let target = read_symlink_target(&link).unwrap();
        assert_eq!(target, "/some/target/path");
    }

    #[test]
    fn test_scan_tree_keys_and_skips_backend_metadata() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/hosts"), "x").unwrap();
        fs::create_dir_all(dir.path().join(".zfs/snapshot")).unwrap();
        fs::create_dir_all(dir.path().join("var/.zfs")).unwrap();

        let tree = scan_tree(dir.path()).unwrap();
        let keys: Vec<_> = tree.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/", "/etc", "/etc/hosts", "/var", "/var/.zfs"]);
    }

    #[test]
    fn test_contents_equal() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, "same content").unwrap();
        fs::write(&b, "same content").unwrap();
        fs::write(&c, "same c0ntent").unwrap();

        assert!(contents_equal(&a, &b).unwrap());
        assert!(!contents_equal(&a, &c).unwrap());
    }
}
