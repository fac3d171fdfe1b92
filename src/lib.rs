//! ocigraph - copy-on-write layer graph for container images
//!
//! a storage engine for container runtimes: filesystems live on a
//! copy-on-write backend (zfs datasets, or plain directories), committed
//! changesets become immutable content-addressed layers, images are
//! ordered layer chains plus a config blob, and containers are writable
//! clones of an image's top layer.
//!
//! # Core concepts
//!
//! - **Filesystem**: one backing store on the backend, random 16-char id
//! - **Layer**: a committed changeset, identified by its chain id over the
//!   parent layer and the diff id (sha256 of the uncompressed changeset tar)
//! - **Image**: layers base first plus an opaque config blob
//! - **Container**: a writable filesystem cloned from an image's top layer
//! - **Distribution**: save/load of images as OCI image-layout archives
//!
//! # Example usage
//!
//! ```no_run
//! use ocigraph::{ops, Config, Distribution, Graph};
//! use std::path::Path;
//!
//! let graph = Graph::init(Path::new("/var/lib/ocigraph"), Config::default()).unwrap();
//!
//! // build a one-layer image
//! let mut builder = ops::ImageBuilder::new(&graph);
//! builder
//!     .step(|root| {
//!         std::fs::write(root.join("hello"), "world")
//!             .map_err(|e| ocigraph::Error::Io { path: root.join("hello"), source: e })
//!     })
//!     .unwrap();
//! let image = builder.finish(b"{}").unwrap();
//!
//! // ship it
//! let dist = Distribution::for_graph(&graph);
//! dist.save(&graph, &image.id, Path::new("/tmp/hello.tar")).unwrap();
//! ```

mod config;
mod error;
mod graph;
mod hash;
mod id;
mod record;
mod tags;

pub mod backend;
pub mod distribution;
pub mod fs;
pub mod ops;
pub mod types;

pub use backend::{Capabilities, DiffSource, DirBackend, GraphBackend, ZfsBackend};
pub use config::{
    BackendConfig, BackendKind, Compression, Config, DistributionConfig, RuntimeConfig, ZfsConfig,
};
pub use distribution::{Distribution, SavedArchive};
pub use error::{Error, Result};
pub use graph::{Graph, GraphLock};
pub use hash::{digest_bytes, digest_file, Digest};
pub use id::{ContainerId, DiffId, FilesystemId, ImageId, LayerId};
pub use record::{blob_exists, blob_path, read_blob, write_blob};
pub use tags::{
    list_tags, list_tags_matching, resolve_image, resolve_tag, tag_exists, tag_image,
    tags_for_image, untag,
};
pub use types::{
    Change, ChangeKind, Changeset, Container, ContainerState, EntryType, Filesystem,
    FilesystemState, Image, Layer,
};
