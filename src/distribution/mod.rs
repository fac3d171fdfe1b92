//! portable image archives
//!
//! an archive is an uncompressed tar laid out as an OCI image layout: an
//! `oci-layout` marker, `index.json` and content-addressed blobs for the
//! manifest, the config and one compressed changeset per layer. layer
//! descriptors carry the uncompressed diff id and size as annotations so
//! a load can verify every layer before anything is materialized.

mod codec;
mod load;
pub mod manifest;
mod save;

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::warn;

use crate::config::DistributionConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::remove_path;
use crate::graph::Graph;
use crate::id::ImageId;
use crate::types::Image;

pub use codec::{
    compression_for, media_type, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_XZ, MEDIA_TYPE_LAYER_ZSTD,
};
pub use save::SavedArchive;

/// save/load codec between images and archives
///
/// built once from configuration and handed to every save and load.
#[derive(Clone, Debug)]
pub struct Distribution {
    config: DistributionConfig,
}

impl Distribution {
    pub fn new(config: DistributionConfig) -> Self {
        Self { config }
    }

    /// codec configured by the store's `[distribution]` table
    pub fn for_graph(graph: &Graph) -> Self {
        Self::new(graph.config().distribution.clone())
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// write image `id` to an archive at `dest`
    ///
    /// the archive only appears at `dest` once it is complete.
    pub fn save(&self, graph: &Graph, id: &ImageId, dest: &Path) -> Result<SavedArchive> {
        save::save(self, graph, id, dest)
    }

    /// register the image in `archive`, optionally tagging it
    ///
    /// every digest is checked before the first layer is materialized. on
    /// failure nothing is registered and layers created by this load are
    /// removed again.
    pub fn load(&self, graph: &Graph, archive: &Path, tag: Option<&str>) -> Result<Image> {
        load::load(self, graph, archive, tag)
    }

    /// run `work` over `items` on a pool of `parallelism` threads
    ///
    /// results keep the order of `items`; the first error wins.
    fn run_parallel<T, U, F>(&self, items: &[T], work: F) -> Result<Vec<U>>
    where
        T: Sync,
        U: Send,
        F: Fn(&T) -> Result<U> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism.max(1))
            .build()
            .map_err(|e| Error::InvalidState(format!("cannot start worker pool: {}", e)))?;
        pool.install(|| items.par_iter().map(&work).collect())
    }
}

/// scratch directory under the store's tmp/, removed on drop
struct Staging {
    path: PathBuf,
}

impl Staging {
    fn new(graph: &Graph) -> Result<Self> {
        let path = graph.tmp_file();
        fs::create_dir(&path).with_path(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = remove_path(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;

    #[test]
    fn test_run_parallel_keeps_order() {
        let dist = Distribution::new(DistributionConfig {
            parallelism: 3,
            ..DistributionConfig::default()
        });
        let items: Vec<u64> = (0..50).collect();
        let squares = dist.run_parallel(&items, |n| Ok(n * n)).unwrap();
        assert_eq!(squares, items.iter().map(|n| n * n).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_parallel_propagates_errors() {
        let dist = Distribution::new(DistributionConfig {
            compression: Compression::Zstd,
            level: None,
            parallelism: 0,
        });
        let result = dist.run_parallel(&[1, 2, 3], |n| {
            if *n == 2 {
                Err(Error::InvalidState("two".to_string()))
            } else {
                Ok(*n)
            }
        });
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_staging_removed_on_drop() {
        let (_dir, graph) = crate::graph::tests::test_graph();
        let staging = Staging::new(&graph).unwrap();
        let path = staging.path().to_path_buf();
        fs::write(path.join("f"), b"x").unwrap();
        drop(staging);
        assert!(!path.exists());
    }
}
