//! identifier namespaces
//!
//! filesystem ids and container ids are random tokens with no relation to
//! content. diff ids, layer (chain) ids and image ids are content digests.
//! each namespace is its own type so ids from different namespaces never
//! compare equal by accident.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{digest_bytes, Digest};

const FILESYSTEM_ID_LEN: usize = 16;
const FILESYSTEM_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CONTAINER_ID_LEN: usize = 64;

/// random, uppercase alphanumeric id of a filesystem
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilesystemId(String);

impl FilesystemId {
    /// generate a fresh random id
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..FILESYSTEM_ID_LEN)
            .map(|_| FILESYSTEM_ID_CHARSET[rng.gen_range(0..FILESYSTEM_ID_CHARSET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == FILESYSTEM_ID_LEN
            && s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if !valid {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FilesystemId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<FilesystemId> for String {
    fn from(id: FilesystemId) -> Self {
        id.0
    }
}

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilesystemId({})", self.0)
    }
}

/// random 64-char lowercase hex id of a container
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn generate() -> Self {
        let bytes: [u8; CONTAINER_ID_LEN / 2] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == CONTAINER_ID_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// first 12 chars, for display
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for ContainerId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.short())
    }
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            pub fn from_digest(digest: Digest) -> Self {
                Self(digest)
            }

            pub fn digest(&self) -> &Digest {
                &self.0
            }

            pub fn parse(s: &str) -> Result<Self> {
                Digest::parse(s).map(Self)
            }

            pub fn short(&self) -> String {
                self.0.short()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.short())
            }
        }
    };
}

digest_id!(
    /// digest of a layer's uncompressed changeset stream
    DiffId
);

digest_id!(
    /// identity of a layer: its diff id chained onto its parent's layer id
    LayerId
);

digest_id!(
    /// identity of an image: digest of its config digest and layer chain
    ImageId
);

impl LayerId {
    /// chain id of a layer with `diff_id` on top of `parent`
    ///
    /// a base layer's id equals its diff id, so the same content committed
    /// on different parents yields different layers.
    pub fn chain(parent: Option<&LayerId>, diff_id: &DiffId) -> Self {
        match parent {
            None => Self(diff_id.0),
            Some(parent) => Self(digest_bytes(format!("{} {}", parent, diff_id).as_bytes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_id_shape() {
        let id = FilesystemId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        assert_eq!(FilesystemId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_filesystem_ids_are_random() {
        assert_ne!(FilesystemId::generate(), FilesystemId::generate());
    }

    #[test]
    fn test_filesystem_id_chars_are_uniform() {
        let chars: Vec<u8> = (0..1000)
            .flat_map(|_| FilesystemId::generate().as_str().as_bytes().to_vec())
            .collect();
        let digits = chars.iter().filter(|b| b.is_ascii_digit()).count();
        // 10 of 36 symbols are digits
        let share = digits as f64 / chars.len() as f64;
        assert!((0.24..0.32).contains(&share), "digit share {}", share);
    }

    #[test]
    fn test_filesystem_id_rejects_lowercase() {
        assert!(FilesystemId::parse("abcdefghijklmnop").is_err());
        assert!(FilesystemId::parse("ABC").is_err());
    }

    #[test]
    fn test_container_id_shape() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id.short().len(), 12);
        assert_eq!(ContainerId::parse(id.as_str()).unwrap(), id);
        assert!(ContainerId::parse("XYZ").is_err());
    }

    #[test]
    fn test_chain_id_base_equals_diff_id() {
        let diff = DiffId::from_digest(digest_bytes(b"changes"));
        let base = LayerId::chain(None, &diff);
        assert_eq!(base.digest(), diff.digest());
    }

    #[test]
    fn test_chain_id_depends_on_parent() {
        let diff = DiffId::from_digest(digest_bytes(b"changes"));
        let p1 = LayerId::from_digest(digest_bytes(b"p1"));
        let p2 = LayerId::from_digest(digest_bytes(b"p2"));
        assert_ne!(LayerId::chain(Some(&p1), &diff), LayerId::chain(Some(&p2), &diff));
        assert_eq!(LayerId::chain(Some(&p1), &diff), LayerId::chain(Some(&p1), &diff));
    }

    #[test]
    fn test_ids_serde_as_strings() {
        let id = FilesystemId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: FilesystemId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<FilesystemId>("\"lower\"").is_err());
    }
}
