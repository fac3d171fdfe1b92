use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// store configuration kept in config.toml
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default, skip_serializing_if = "RuntimeConfig::is_empty")]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// config using the zfs backend rooted at `dataset`
    pub fn zfs(dataset: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Zfs,
                zfs: ZfsConfig {
                    dataset: dataset.into(),
                    ..ZfsConfig::default()
                },
            },
            ..Self::default()
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }
}

/// which copy-on-write backend stores filesystems
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// plain directories, full copies on clone
    #[default]
    Dir,
    /// zfs datasets, snapshots and clones
    Zfs,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Dir => f.write_str("dir"),
            BackendKind::Zfs => f.write_str("zfs"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub zfs: ZfsConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZfsConfig {
    /// parent dataset under which one dataset per filesystem is created
    pub dataset: String,
    /// use `zfs diff` instead of walking both trees
    #[serde(default = "default_true")]
    pub native_diff: bool,
    #[serde(default = "default_zfs_bin")]
    pub zfs_bin: PathBuf,
    #[serde(default = "default_zpool_bin")]
    pub zpool_bin: PathBuf,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            dataset: "rpool/ocigraph".to_string(),
            native_diff: true,
            zfs_bin: default_zfs_bin(),
            zpool_bin: default_zpool_bin(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_zfs_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/zfs")
}

fn default_zpool_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/zpool")
}

/// compression applied to layer blobs in saved archives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// fast, general purpose
    #[default]
    Gzip,
    /// fast with a better ratio than gzip
    Zstd,
    /// slow, high ratio
    Xz,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub compression: Compression,
    /// compression level, codec default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    /// worker threads for per-layer compression and decompression
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            level: None,
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// external runtime invoked on container start/stop
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
}

impl RuntimeConfig {
    fn is_empty(&self) -> bool {
        self.program.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::zfs("tank/graph");
        config.backend.zfs.native_diff = false;
        config.distribution.compression = Compression::Xz;
        config.distribution.level = Some(6);
        config.distribution.parallelism = 3;
        config.runtime.program = Some(PathBuf::from("/usr/bin/runc"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Dir);
        assert_eq!(config.distribution.compression, Compression::Gzip);
        assert!(config.distribution.parallelism >= 1);
        assert!(config.runtime.program.is_none());
    }

    #[test]
    fn test_config_zfs_defaults() {
        let toml_str = r#"
[backend]
kind = "zfs"

[backend.zfs]
dataset = "tank/oci"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.kind, BackendKind::Zfs);
        assert_eq!(config.backend.zfs.dataset, "tank/oci");
        assert!(config.backend.zfs.native_diff);
        assert_eq!(config.backend.zfs.zfs_bin, PathBuf::from("/usr/sbin/zfs"));
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let toml_str = r#"
[distribution]
compression = "lz4"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
