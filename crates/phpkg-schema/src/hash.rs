//! SHA-256 digests of archives and their `.sha256` sidecars.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::NameError;

/// A validated SHA256 digest (64 lowercase hex characters).
///
/// Digests are validated at deserialization time, so an index or sidecar
/// with a malformed checksum is rejected on read instead of at download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix, and the
    /// `sha256sum` output form (`<hex>  <file>`).
    ///
    /// # Errors
    ///
    /// Returns [`NameError::InvalidDigest`] if the hex portion is not
    /// exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, NameError> {
        let s = s.into();
        let trimmed = s.trim();
        let hex = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
        let hex = hex.split_whitespace().next().unwrap_or_default();

        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NameError::InvalidDigest(s));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Digest of an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Wrap a finished hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_compute_known_value() {
        assert_eq!(Sha256Digest::compute(b"").as_str(), EMPTY);
    }

    #[test]
    fn test_accepts_prefix_and_sha256sum_output() {
        let upper = EMPTY.to_uppercase();
        assert_eq!(Sha256Digest::new(format!("sha256:{upper}")).unwrap().as_str(), EMPTY);
        assert_eq!(
            Sha256Digest::new(format!("{EMPTY}  foo_1.0_darwin-arm64.tar.zst\n"))
                .unwrap()
                .as_str(),
            EMPTY
        );
    }

    #[test]
    fn test_rejects_bad_digest() {
        assert!(Sha256Digest::new("abc").is_err());
        assert!(Sha256Digest::new("z".repeat(64)).is_err());
        assert!(serde_json::from_str::<Sha256Digest>("\"nothex\"").is_err());
    }
}
