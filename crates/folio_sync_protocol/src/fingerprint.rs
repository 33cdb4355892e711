//! Device fingerprint values.

use serde::{Deserialize, Serialize};

/// A per-device fingerprint value.
///
/// The value is a hex-encoded random byte string generated once per device.
/// Its presence in the cloud-hosted device set proves the device has synced
/// against the current cloud generation; its absence, while a local copy
/// still exists, proves the cloud was wiped since the device last synced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Creates a fingerprint from an already-encoded value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the encoded value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_value() {
        let fp = Fingerprint::from("some-value");
        assert_eq!(fp.as_str(), "some-value");
        assert_eq!(fp.to_string(), "some-value");
    }
}
