use std::path::PathBuf;

/// error type for graph operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graph store not found at {0}")]
    NoStore(PathBuf),

    #[error("graph store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("backend {op} failed on {target}: {message}")]
    Backend {
        op: &'static str,
        target: String,
        message: String,
    },

    #[error("invalid tag name: {0}")]
    InvalidTag(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("runtime hook failed for container {container}: {message}")]
    Runtime { container: String, message: String },

    #[error("lock contention on {0}")]
    LockContention(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn backend(op: &'static str, target: impl Into<String>, message: impl ToString) -> Self {
        Error::Backend {
            op,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
