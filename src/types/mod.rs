mod changeset;
mod container;
mod filesystem;
mod image;
mod layer;

pub use changeset::{join_path, Change, ChangeKind, Changeset, EntryType};
pub use container::{Container, ContainerState};
pub use filesystem::{Filesystem, FilesystemState, SnapshotRef};
pub use image::Image;
pub(crate) use image::now;
pub use layer::{Layer, MEDIA_TYPE_LAYER_TAR};
