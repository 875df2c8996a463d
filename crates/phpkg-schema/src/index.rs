//! The published package index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Dependency, PackageName, Sha256Digest, Version};

/// Current index format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// One downloadable package in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Package name.
    pub name: PackageName,
    /// Package version.
    pub version: Version,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Runtime dependencies.
    #[serde(default)]
    pub depends: Vec<Dependency>,
    /// Virtual names provided.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Download URL of the archive.
    pub url: String,
    /// Digest of the compressed archive.
    pub sha256: Sha256Digest,
    /// Archive size in bytes.
    pub size: u64,
    /// Unpacked size in bytes.
    pub installed_size: u64,
}

/// Packages published for one platform, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformPackages {
    /// Entries, at most one per name.
    pub packages: Vec<IndexEntry>,
}

/// The index document: `{version, generated, platforms: {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Format version, currently [`INDEX_FORMAT_VERSION`].
    pub version: u32,
    /// RFC 3339 generation time, supplied by the caller.
    pub generated: String,
    /// Packages keyed by platform string (`darwin-arm64`).
    pub platforms: BTreeMap<String, PlatformPackages>,
}

impl IndexDocument {
    /// An empty index.
    pub fn new(generated: impl Into<String>) -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            generated: generated.into(),
            platforms: BTreeMap::new(),
        }
    }

    /// Look up a package on a platform.
    pub fn find(&self, platform: &str, name: &str) -> Option<&IndexEntry> {
        self.platforms
            .get(platform)?
            .packages
            .iter()
            .find(|e| e.name.as_str() == name)
    }

    /// Total number of entries across all platforms.
    pub fn len(&self) -> usize {
        self.platforms.values().map(|p| p.packages.len()).sum()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pretty-printed JSON, newline terminated. Map keys are already sorted
    /// and struct fields have a fixed order, so equal documents encode to
    /// equal bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Parse an index document.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the document is malformed.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str) -> IndexEntry {
        IndexEntry {
            name: PackageName::new(name),
            version: Version::new(version),
            description: String::new(),
            depends: vec![],
            provides: vec![],
            url: format!("https://example.invalid/{name}_{version}_darwin-arm64.tar.zst"),
            sha256: Sha256Digest::compute(name.as_bytes()),
            size: 10,
            installed_size: 20,
        }
    }

    #[test]
    fn test_find_and_len() {
        let mut doc = IndexDocument::new("2024-01-01T00:00:00Z");
        assert!(doc.is_empty());
        doc.platforms.insert(
            "darwin-arm64".to_string(),
            PlatformPackages {
                packages: vec![entry("foo", "1.3.0"), entry("zlib", "1.3.1")],
            },
        );
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.find("darwin-arm64", "foo").unwrap().version, "1.3.0");
        assert!(doc.find("darwin-amd64", "foo").is_none());
    }

    #[test]
    fn test_json_round_trip_preserves_document() {
        let mut doc = IndexDocument::new("2024-01-01T00:00:00Z");
        doc.platforms
            .entry("linux-amd64".to_string())
            .or_default()
            .packages
            .push(entry("foo", "1.0"));
        let bytes = doc.to_json().unwrap();
        assert_eq!(IndexDocument::from_json(&bytes).unwrap(), doc);
        assert!(String::from_utf8(bytes).unwrap().starts_with("{\n  \"version\": 1,"));
    }
}
