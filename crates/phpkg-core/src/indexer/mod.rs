//! Index aggregation.
//!
//! Packages are collected from a local dist directory ([`local`]) or the
//! assets of a published release ([`release`]), reduced to one entry per
//! `(platform, name)` and written as a single [`IndexDocument`].

pub mod local;
#[cfg(feature = "network")]
pub mod release;

use std::collections::BTreeMap;

use phpkg_schema::{IndexDocument, IndexEntry, NameError, PackageManifest, Platform, Sha256Digest};
use thiserror::Error;

pub use local::collect_local;
#[cfg(feature = "network")]
pub use release::{ReleaseOptions, collect_release};

/// Errors raised while aggregating an index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// An archive's manifest is missing or invalid. Non-fatal: the package
    /// is skipped with a warning.
    #[error("malformed manifest in {path}: {reason}")]
    MalformedManifest {
        /// Archive path or asset name.
        path: String,
        /// What was wrong.
        reason: String,
    },

    /// I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP failure while talking to the release API.
    #[cfg(feature = "network")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A name or digest could not be parsed.
    #[error(transparent)]
    Naming(#[from] NameError),
}

/// A package found by a collector, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPackage {
    /// Platform the package was built for.
    pub platform: Platform,
    /// The index entry.
    pub entry: IndexEntry,
}

impl IndexedPackage {
    /// Entry for an archive whose manifest has been read.
    pub fn from_manifest(manifest: PackageManifest, url: String, sha256: Sha256Digest, size: u64) -> Self {
        Self {
            platform: manifest.platform,
            entry: IndexEntry {
                name: manifest.name,
                version: manifest.version,
                description: manifest.description,
                depends: manifest.depends,
                provides: manifest.provides,
                url,
                sha256,
                size,
                installed_size: manifest.installed_size,
            },
        }
    }
}

/// Keep one package per `(platform, name)`: the one with the greatest
/// version. Equal versions fall back to the download URL so the choice
/// does not depend on input order.
pub fn deduplicate(packages: Vec<IndexedPackage>) -> Vec<IndexedPackage> {
    let mut best: BTreeMap<(String, String), IndexedPackage> = BTreeMap::new();

    for pkg in packages {
        let key = (pkg.platform.to_string(), pkg.entry.name.to_string());
        match best.get(&key) {
            Some(current)
                if (&current.entry.version, &current.entry.url)
                    >= (&pkg.entry.version, &pkg.entry.url) => {}
            _ => {
                best.insert(key, pkg);
            }
        }
    }

    best.into_values().collect()
}

/// Build the index document from collected packages.
///
/// Duplicates are removed with [`deduplicate`]; platforms and packages are
/// sorted, so the same packages and `generated` value always encode to the
/// same bytes.
pub fn build_index(packages: Vec<IndexedPackage>, generated: &str) -> IndexDocument {
    let mut doc = IndexDocument::new(generated);
    for pkg in deduplicate(packages) {
        doc.platforms
            .entry(pkg.platform.to_string())
            .or_default()
            .packages
            .push(pkg.entry);
    }
    for platform in doc.platforms.values_mut() {
        platform.packages.sort_by(|a, b| a.name.cmp(&b.name));
    }
    doc
}

/// `{base}/{file}` without doubled slashes.
pub fn join_url(base: &str, file: &str) -> String {
    if base.is_empty() {
        return file.to_string();
    }
    format!("{}/{file}", base.trim_end_matches('/'))
}
