//! high-level operations on a graph store

pub(crate) mod changeset;
pub(crate) mod commit;
pub(crate) mod container;
pub(crate) mod diff;
pub(crate) mod filesystem;
pub(crate) mod gc;
pub(crate) mod image;
pub(crate) mod layer;
pub(crate) mod verify;

pub use changeset::{
    apply_changeset, write_changeset, write_changeset_file, ApplyStats, OPAQUE_WHITEOUT,
    WHITEOUT_PREFIX,
};
pub use commit::commit;
pub use container::{
    container, container_diff, containers_using_image, create_container, list_containers,
    remove_container, resolve_container, start_container, stop_container, CommandHooks, NoopHooks,
    RuntimeHooks,
};
pub use diff::{diff_candidates, diff_filesystem, fallback_diff};
pub use filesystem::{
    create_filesystem, create_filesystem_from_layer, filesystem, filesystem_children,
    filesystem_exists, freeze_filesystem, list_filesystems, mount_filesystem, remove_filesystem,
    unmount_filesystem,
};
pub use gc::{gc, GcStats};
pub use image::{
    image, image_config, image_exists, import_tar, list_images, register_image, remove_image,
    ImageBuilder,
};
pub use layer::{
    find_layer, layer, layer_blob_path, layer_children, layer_exists, list_layers, remove_layer,
};
pub use verify::{verify, Problem, ProblemKind, VerifyReport};
