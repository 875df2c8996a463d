//! The package manifest embedded in every archive.
//!
//! The manifest deliberately carries no timestamps: packaging the same
//! staged files twice yields byte-identical JSON, and therefore identical
//! archives and digests.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ArchiveName, NameError, PackageName, Platform, Version};

static DEPENDENCY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9._+-]*)\s*(?:\(\s*>=\s*([^\s()]+)\s*\))?$").ok()
});

/// A package-level dependency: `name` or `name (>= version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    /// Required package.
    pub name: PackageName,
    /// Lowest acceptable version, if any.
    pub min_version: Option<Version>,
}

impl Dependency {
    /// Dependency on any version of `name`.
    pub fn any(name: impl Into<PackageName>) -> Self {
        Self {
            name: name.into(),
            min_version: None,
        }
    }

    /// Dependency on `name` at `min_version` or later.
    pub fn at_least(name: impl Into<PackageName>, min_version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            min_version: Some(min_version.into()),
        }
    }

    /// Whether `version` of the named package satisfies this dependency.
    pub fn satisfied_by(&self, version: &Version) -> bool {
        self.min_version
            .as_ref()
            .is_none_or(|min| crate::version::satisfies_minimum(version, min))
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.min_version {
            Some(min) => write!(f, "{} (>= {min})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl std::str::FromStr for Dependency {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NameError::InvalidDependency(s.to_string());
        let lowered = s.trim().to_lowercase();
        let caps = DEPENDENCY
            .as_ref()
            .and_then(|re| re.captures(&lowered))
            .ok_or_else(invalid)?;

        Ok(Self {
            name: PackageName::new(&caps[1]),
            min_version: caps.get(2).map(|m| Version::new(m.as_str())),
        })
    }
}

impl TryFrom<String> for Dependency {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dependency> for String {
    fn from(dep: Dependency) -> Self {
        dep.to_string()
    }
}

/// How PHP loads an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Extension name as used in `extension=` / `zend_extension=`.
    pub name: String,
    /// Loaded with `zend_extension=` (opcache, xdebug).
    #[serde(default)]
    pub zend: bool,
    /// Load order; lower loads first (the `conf.d/NN-name.ini` prefix).
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    20
}

impl ExtensionInfo {
    /// File name of the generated ini snippet (`20-redis.ini`).
    pub fn ini_file_name(&self) -> String {
        format!("{:02}-{}.ini", self.priority, self.name)
    }

    /// Contents of the ini snippet.
    pub fn ini_contents(&self) -> String {
        let directive = if self.zend {
            "zend_extension"
        } else {
            "extension"
        };
        format!("{directive}={}.so\n", self.name)
    }
}

/// Manifest document stored at `.phpkg/manifest.json` inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Package name.
    pub name: PackageName,
    /// Package version.
    pub version: Version,
    /// Packaging revision of the same upstream version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    /// PHP `major.minor` the package was built against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub php_version: Option<Version>,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Target platform.
    pub platform: Platform,
    /// Runtime dependencies.
    #[serde(default)]
    pub depends: Vec<Dependency>,
    /// Packages that cannot be installed alongside this one.
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Virtual names provided.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Sum of the sizes of all regular files, in bytes.
    pub installed_size: u64,
    /// Sorted, `/`-separated paths relative to the install prefix. Empty for
    /// meta-packages.
    #[serde(default)]
    pub files: Vec<String>,
    /// Extension loading metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionInfo>,
}

impl PackageManifest {
    /// Meta-packages carry dependencies but no files.
    pub fn is_meta(&self) -> bool {
        self.files.is_empty()
    }

    /// Canonical archive name for this manifest.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] if the name or version cannot be encoded in
    /// a filename.
    pub fn archive_name(&self) -> Result<ArchiveName, NameError> {
        ArchiveName::new(self.name.clone(), self.version.clone(), self.platform.clone())
    }

    /// Stable pretty-printed JSON encoding, newline terminated.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Parse a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the document is malformed or a
    /// required field (such as `platform`) is missing.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
