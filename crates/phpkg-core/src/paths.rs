//! Directory layout under the phpkg home.

use dirs::home_dir;
use std::path::{Path, PathBuf};

use phpkg_schema::{UnitName, Version};

/// Returns the phpkg home directory (`$PHPKG_HOME`, else `~/.phpkg`), or
/// None if the user's home cannot be resolved.
pub fn try_phpkg_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("PHPKG_HOME") {
        if !val.is_empty() {
            return Some(PathBuf::from(val));
        }
    }
    home_dir().map(|h| h.join(".phpkg"))
}

/// Directory layout under a phpkg home.
///
/// ```text
/// <home>/
///   work/<unit>/          per-unit build directory
///   stage/<unit>/         files installed by the build, input to packaging
///   deps/                 static libraries linked into PHP and extensions
///   dist/                 archives and checksum sidecars
///   state/markers/        one <unit>.json record per built unit
///   state/build-report.json
///   logs/<unit>-<version>.log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// Layout rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The root directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Work directories: `<home>/work`
    pub fn work_dir(&self) -> PathBuf {
        self.home.join("work")
    }

    /// Staging directories: `<home>/stage`
    pub fn stage_dir(&self) -> PathBuf {
        self.home.join("stage")
    }

    /// Package output: `<home>/dist`
    pub fn dist_dir(&self) -> PathBuf {
        self.home.join("dist")
    }

    /// Install prefix of the static libraries: `<home>/deps`
    pub fn deps_prefix(&self) -> PathBuf {
        self.home.join("deps")
    }

    /// Persistent state: `<home>/state`
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// Marker records: `<home>/state/markers`
    pub fn markers_dir(&self) -> PathBuf {
        self.state_dir().join("markers")
    }

    /// Logs: `<home>/logs`
    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Last run summary: `<home>/state/build-report.json`
    pub fn report_path(&self) -> PathBuf {
        self.state_dir().join("build-report.json")
    }

    /// Work directory of one unit.
    pub fn unit_work_dir(&self, unit: &UnitName) -> PathBuf {
        self.work_dir().join(unit.file_stem())
    }

    /// Staging directory of one unit.
    pub fn unit_stage_dir(&self, unit: &UnitName) -> PathBuf {
        self.stage_dir().join(unit.file_stem())
    }

    /// Build log path for one unit at one version.
    pub fn build_log_path(&self, unit: &UnitName, version: &Version) -> PathBuf {
        self.log_dir()
            .join(format!("{}-{version}.log", unit.file_stem()))
    }

    /// Create every top-level directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.work_dir(),
            self.stage_dir(),
            self.dist_dir(),
            self.deps_prefix(),
            self.markers_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_paths_are_encoded() {
        let paths = Paths::new("/tmp/phpkg");
        let unit = UnitName::new("ext:redis");
        assert_eq!(
            paths.unit_work_dir(&unit),
            PathBuf::from("/tmp/phpkg/work/ext%3aredis")
        );
        assert_eq!(
            paths.build_log_path(&unit, &Version::new("6.0.2")),
            PathBuf::from("/tmp/phpkg/logs/ext%3aredis-6.0.2.log")
        );
    }

    #[test]
    fn test_ensure_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        paths.ensure().unwrap();
        assert!(paths.markers_dir().is_dir());
        assert!(paths.dist_dir().is_dir());
    }
}
