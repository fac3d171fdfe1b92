use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::info;

use crate::backend::{open_backend, GraphBackend};
use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};

const STORE_DIRS: &[&str] = &[
    "filesystems",
    "layers",
    "images",
    "containers",
    "blobs/sha256",
    "tags",
    "locks",
    "tmp",
];

/// a graph store: records, blobs and the backend holding filesystem trees
pub struct Graph {
    path: PathBuf,
    config: Config,
    backend: Box<dyn GraphBackend>,
}

impl Graph {
    /// initialize a new store at `path` with the backend `config` names
    pub fn init(path: &Path, config: Config) -> Result<Self> {
        let backend = open_backend(path, &config)?;
        Self::init_with_backend(path, config, backend)
    }

    /// initialize a new store on an already constructed backend
    pub fn init_with_backend(
        path: &Path,
        config: Config,
        backend: Box<dyn GraphBackend>,
    ) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        for dir in STORE_DIRS {
            let dir = path.join(dir);
            fs::create_dir_all(&dir).with_path(&dir)?;
        }

        backend.prepare()?;
        backend.validate()?;
        config.save(&config_path)?;
        info!(root = %path.display(), backend = %backend.kind(), "initialized graph store");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            backend,
        })
    }

    /// open an existing store, validating its backend
    pub fn open(path: &Path) -> Result<Self> {
        let config = Self::load_config(path)?;
        let backend = open_backend(path, &config)?;
        Self::open_with_backend(path, backend)
    }

    /// open an existing store on an already constructed backend
    pub fn open_with_backend(path: &Path, backend: Box<dyn GraphBackend>) -> Result<Self> {
        let config = Self::load_config(path)?;
        backend.validate()?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            backend,
        })
    }

    fn load_config(path: &Path) -> Result<Config> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoStore(path.to_path_buf()));
        }
        Config::load(&config_path)
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &dyn GraphBackend {
        self.backend.as_ref()
    }

    pub fn filesystems_path(&self) -> PathBuf {
        self.path.join("filesystems")
    }

    pub fn layers_path(&self) -> PathBuf {
        self.path.join("layers")
    }

    pub fn images_path(&self) -> PathBuf {
        self.path.join("images")
    }

    pub fn containers_path(&self) -> PathBuf {
        self.path.join("containers")
    }

    pub fn blobs_path(&self) -> PathBuf {
        self.path.join("blobs/sha256")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.path.join("tags")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// a fresh, unused path under tmp/
    pub fn tmp_file(&self) -> PathBuf {
        self.tmp_path().join(uuid::Uuid::new_v4().to_string())
    }

    fn lock_path(&self, kind: &str, id: &str) -> PathBuf {
        self.path.join("locks").join(format!("{}-{}.lock", kind, id))
    }

    /// block until the exclusive advisory lock on `<kind>-<id>` is held
    ///
    /// the lock is released when the guard drops.
    pub fn lock(&self, kind: &str, id: &str) -> Result<GraphLock> {
        let lock_path = self.lock_path(kind, id);
        let file = open_lock_file(&lock_path)?;
        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|_| Error::LockContention(format!("{}-{}", kind, id)))?;
        Ok(GraphLock { flock })
    }

    /// take the lock on `<kind>-<id>` only if nobody holds it
    pub fn try_lock(&self, kind: &str, id: &str) -> Result<Option<GraphLock>> {
        let lock_path = self.lock_path(kind, id);
        let file = open_lock_file(&lock_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(GraphLock { flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention(format!("{}-{}", kind, id))),
        }
    }

    /// store-wide lock serializing image and tag registry changes and gc
    pub fn lock_store(&self) -> Result<GraphLock> {
        self.lock("store", "registry")
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_path(path)
}

/// guard that holds a store lock until dropped
pub struct GraphLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}
