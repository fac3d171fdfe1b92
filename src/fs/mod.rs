pub mod read;
pub mod write;

use std::ffi::OsStr;

pub use read::{contents_equal, entry_type, read_symlink_target, scan_tree, FileMetadata};
pub use write::{
    apply_metadata, copy_tree, create_special, create_symlink, fsync_dir, is_root, remove_path,
};

/// name of the control directory zfs exposes at a dataset root
pub const ZFS_CONTROL_DIR: &str = ".zfs";

/// true for root-level entries owned by the storage backend, never by a layer
pub fn is_backend_metadata(name: &OsStr) -> bool {
    name == ZFS_CONTROL_DIR
}
