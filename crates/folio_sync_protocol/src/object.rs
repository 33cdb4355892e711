//! Content-addressed object identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of a content-addressed binary blob referenced by commits.
///
/// The digest scheme belongs to the storage layer; the sync engine treats
/// the identifier as an opaque key for cloud blob upload and download.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    /// Creates an object id from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_equality() {
        assert_eq!(ObjectId::from("obj"), ObjectId::new(b"obj".to_vec()));
        assert_ne!(ObjectId::from("obj"), ObjectId::from("other"));
    }
}
