use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ContainerId, FilesystemId, ImageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// a writable filesystem cloned on top of an image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub image: ImageId,
    /// exclusively owned writable filesystem
    pub filesystem: FilesystemId,
    pub state: ContainerState,
    pub created: i64,
}
