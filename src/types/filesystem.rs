use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::id::{ContainerId, FilesystemId, LayerId};

/// lifecycle state of a filesystem
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemState {
    Created,
    Mounted,
    Unmounted,
    Committed,
    Removed,
}

impl fmt::Display for FilesystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilesystemState::Created => "created",
            FilesystemState::Mounted => "mounted",
            FilesystemState::Unmounted => "unmounted",
            FilesystemState::Committed => "committed",
            FilesystemState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// opaque name of a frozen point-in-time snapshot inside the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(pub String);

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// a single copy-on-write storage unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub id: FilesystemId,
    /// backend handle, e.g. a zfs dataset name
    pub backend_ref: String,
    pub mount_path: PathBuf,
    /// filesystem this one was cloned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<FilesystemId>,
    pub state: FilesystemState,
    /// latest frozen snapshot, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
    /// layer this filesystem materializes, once committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerId>,
    /// container owning this filesystem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerId>,
}

impl Filesystem {
    pub fn is_committed(&self) -> bool {
        self.state == FilesystemState::Committed
    }

    pub fn is_mounted(&self) -> bool {
        self.state == FilesystemState::Mounted
    }

    pub fn is_frozen(&self) -> bool {
        self.snapshot.is_some()
    }
}
