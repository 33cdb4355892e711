//! Opaque server resume cursor.

use serde::{Deserialize, Serialize};

/// Server-issued cursor marking "everything up to here has been delivered".
///
/// Tokens are only usable as resume parameters: the server defines whatever
/// monotonicity they have, so this type deliberately exposes no ordering.
/// Comparing two tokens for anything other than equality is a bug in the
/// caller.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionToken(Vec<u8>);

impl PositionToken {
    /// Creates a position token from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the token as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the token, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for PositionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PositionToken({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let token = PositionToken::new(b"42".to_vec());
        assert_eq!(token.as_bytes(), b"42");
        assert_eq!(token.clone().into_bytes(), b"42".to_vec());
    }

    #[test]
    fn token_equality_only() {
        let a = PositionToken::new(b"a".to_vec());
        let b = PositionToken::new(b"b".to_vec());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
