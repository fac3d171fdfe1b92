use serde::{Deserialize, Serialize};

use crate::id::{DiffId, FilesystemId, LayerId};
use crate::types::Changeset;

/// media type of an uncompressed layer changeset
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// immutable record of a committed changeset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// chain id: unique per (diff_id, parent)
    pub id: LayerId,
    pub diff_id: DiffId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<LayerId>,
    /// sum of changed regular file sizes, fixed at commit
    pub size_bytes: u64,
    pub media_type: String,
    /// frozen filesystem backing this layer, clone source for children
    pub filesystem: FilesystemId,
    pub changeset: Changeset,
    /// unix timestamp of the commit
    pub created: i64,
}

impl Layer {
    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }
}
