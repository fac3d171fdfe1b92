use serde::{Deserialize, Serialize};

use crate::hash::{digest_bytes, Digest};
use crate::id::{ImageId, LayerId};

/// ordered chain of layers, base first, plus an opaque config blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub layers: Vec<LayerId>,
    /// digest of the config blob
    pub config: Digest,
    /// unix timestamp of registration
    pub created: i64,
}

/// the fields an image id is computed over
#[derive(Serialize)]
struct ImageIdentity<'a> {
    config: &'a Digest,
    layers: &'a [LayerId],
}

impl Image {
    /// image value over `layers` and `config`, id derived from both
    pub fn new(layers: Vec<LayerId>, config: Digest) -> Self {
        let id = Self::compute_id(&layers, &config);
        Self {
            id,
            layers,
            config,
            created: now(),
        }
    }

    /// deterministic id over the config digest and layer chain
    pub fn compute_id(layers: &[LayerId], config: &Digest) -> ImageId {
        // serializing a struct of digests cannot fail
        let bytes = serde_json::to_vec(&ImageIdentity { config, layers }).unwrap_or_default();
        ImageId::from_digest(digest_bytes(&bytes))
    }

    pub fn top_layer(&self) -> Option<&LayerId> {
        self.layers.last()
    }

    /// a distinct image with `layer` appended; `self` is left untouched
    pub fn with_layer(&self, layer: LayerId) -> Image {
        let mut layers = self.layers.clone();
        layers.push(layer);
        Image::new(layers, self.config)
    }

    /// true if `other` begins with this image's full layer chain
    pub fn is_prefix_of(&self, other: &Image) -> bool {
        other.layers.starts_with(&self.layers)
    }
}

pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(seed: &[u8]) -> LayerId {
        LayerId::from_digest(digest_bytes(seed))
    }

    #[test]
    fn test_image_id_deterministic() {
        let config = digest_bytes(b"{}");
        let a = Image::new(vec![layer(b"1"), layer(b"2")], config);
        let b = Image::new(vec![layer(b"1"), layer(b"2")], config);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_image_id_depends_on_order_and_config() {
        let config = digest_bytes(b"{}");
        let a = Image::new(vec![layer(b"1"), layer(b"2")], config);
        let b = Image::new(vec![layer(b"2"), layer(b"1")], config);
        let c = Image::new(vec![layer(b"1"), layer(b"2")], digest_bytes(b"{\"a\":1}"));
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_with_layer_is_copy_on_append() {
        let base = Image::new(vec![layer(b"1")], digest_bytes(b"{}"));
        let extended = base.with_layer(layer(b"2"));

        assert_eq!(base.layers.len(), 1);
        assert_eq!(extended.layers.len(), 2);
        assert_ne!(base.id, extended.id);
        assert!(base.is_prefix_of(&extended));
        assert_eq!(extended.top_layer(), Some(&layer(b"2")));
    }
}
