//! Skip-if-built markers.
//!
//! One JSON record per unit at `state/markers/<unit>.json`. A record is
//! only ever replaced wholesale through a temp file and an atomic rename,
//! so concurrent workers never share a partially written file.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use phpkg_schema::{UnitName, Version};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::Registry;

/// Status stored in a marker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    /// The unit was built, packaged and can be skipped.
    Success,
}

/// Contents of one marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Unit name.
    pub unit: UnitName,
    /// Version that was built.
    pub version: Version,
    /// Outcome.
    pub status: MarkerStatus,
    /// When the build finished.
    pub finished_at: DateTime<Utc>,
}

/// Directory of marker records.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    /// Store rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The marker directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, unit: &UnitName) -> PathBuf {
        self.dir.join(format!("{}.json", unit.file_stem()))
    }

    /// Read a unit's marker. Unreadable or corrupt records count as absent.
    pub fn get(&self, unit: &UnitName) -> Option<Marker> {
        let path = self.path_for(unit);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt marker");
                None
            }
        }
    }

    /// True only for a success record of the same version.
    pub fn is_built(&self, unit: &UnitName, version: &Version) -> bool {
        self.get(unit)
            .is_some_and(|m| m.status == MarkerStatus::Success && &m.version == version)
    }

    /// Record a successful build.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record cannot be written.
    pub fn mark_built(&self, unit: &UnitName, version: &Version) -> std::io::Result<()> {
        let marker = Marker {
            unit: unit.clone(),
            version: version.clone(),
            status: MarkerStatus::Success,
            finished_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&marker).map_err(std::io::Error::other)?;
        write_atomic(&self.path_for(unit), &json)?;
        debug!(unit = %unit, version = %version, "marker written");
        Ok(())
    }

    /// Units of `registry` whose marker matches their catalog version.
    pub fn built_set(&self, registry: &Registry) -> HashSet<UnitName> {
        registry
            .all()
            .iter()
            .filter(|u| self.is_built(&u.name, &u.version))
            .map(|u| u.name.clone())
            .collect()
    }

    /// Remove one marker. Missing markers are not an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing marker cannot be removed.
    pub fn clear(&self, unit: &UnitName) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(unit)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove every marker.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed or a marker
    /// cannot be removed.
    pub fn clear_all(&self) -> std::io::Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
///
/// # Errors
///
/// Returns an I/O error if the temp file cannot be written or persisted.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phpkg_schema::{BuildUnit, UnitKind};

    #[test]
    fn test_mark_and_check() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(tmp.path().join("markers"));
        let unit = UnitName::new("ext:redis");
        let v = Version::new("6.1.0");

        assert!(!store.is_built(&unit, &v));
        store.mark_built(&unit, &v).unwrap();
        assert!(store.is_built(&unit, &v));
        assert!(tmp.path().join("markers/ext%3aredis.json").is_file());
    }

    #[test]
    fn test_version_bump_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(tmp.path());
        let unit = UnitName::new("zlib");
        store.mark_built(&unit, &Version::new("1.3.0")).unwrap();
        assert!(!store.is_built(&unit, &Version::new("1.3.1")));
    }

    #[test]
    fn test_corrupt_marker_counts_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(tmp.path());
        std::fs::write(tmp.path().join("zlib.json"), b"{not json").unwrap();
        assert!(!store.is_built(&UnitName::new("zlib"), &Version::new("1.3.1")));
    }

    #[test]
    fn test_built_set_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(tmp.path());

        let mut registry = Registry::new();
        registry
            .register(BuildUnit::new("zlib", UnitKind::Library, "1.3.1"))
            .unwrap();
        registry
            .register(BuildUnit::new("libpng", UnitKind::Library, "1.6.44"))
            .unwrap();

        store.mark_built(&UnitName::new("zlib"), &Version::new("1.3.1")).unwrap();
        store.mark_built(&UnitName::new("libpng"), &Version::new("1.6.43")).unwrap();

        let built = store.built_set(&registry);
        assert_eq!(built, HashSet::from([UnitName::new("zlib")]));

        store.clear(&UnitName::new("zlib")).unwrap();
        store.clear(&UnitName::new("zlib")).unwrap();
        assert!(store.built_set(&registry).is_empty());

        assert_eq!(store.clear_all().unwrap(), 1);
        assert_eq!(store.clear_all().unwrap(), 0);
    }
}
