//! Commit and identifier value types.

use serde::{Deserialize, Serialize};

/// Identifier of a commit.
///
/// Commit ids are opaque byte strings assigned by the storage layer. The
/// sync engine only compares them for equality and passes them through.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(Vec<u8>);

impl CommitId {
    /// Creates a commit id from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<&str> for CommitId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// An immutable unit of change in a page's history.
///
/// `content` is plaintext when the commit lives in local storage and
/// encrypted while it travels through the cloud; the engine never inspects
/// it either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Opaque commit identifier.
    pub id: CommitId,
    /// Opaque commit content.
    pub content: Vec<u8>,
}

impl Commit {
    /// Creates a commit from an id and content.
    pub fn new(id: impl Into<CommitId>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

impl From<&str> for Commit {
    fn from(value: &str) -> Self {
        Commit::new(CommitId::from(value), Vec::new())
    }
}

/// Identifier of one synchronized page within an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(Vec<u8>);

impl PageId {
    /// Creates a page id from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for PageId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Identifier of an application sharing one user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    /// Creates an application id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_id_equality() {
        assert_eq!(CommitId::from("id1"), CommitId::new(b"id1".to_vec()));
        assert_ne!(CommitId::from("id1"), CommitId::from("id2"));
    }

    #[test]
    fn commit_id_debug_is_hex() {
        let id = CommitId::new(vec![0xAB, 0x01]);
        assert_eq!(format!("{id:?}"), "CommitId(ab01)");
    }

    #[test]
    fn commit_construction() {
        let commit = Commit::new("id1", b"content1".to_vec());
        assert_eq!(commit.id.as_bytes(), b"id1");
        assert_eq!(commit.content, b"content1");
    }
}
