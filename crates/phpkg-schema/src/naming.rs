//! Archive filename grammar.
//!
//! The canonical form is `{name}_{version}_{platform}.tar.zst`:
//!
//! - `platform` is `{os}-{arch}` and never contains `_`,
//! - `version` never contains `_` and starts with a digit,
//! - `name` may contain `_` (`php8.3-pdo_sqlite`), which is why parsing
//!   splits from the right.
//!
//! The older `{name}_{version}-{revision}_{platform}` form is the same
//! grammar with a `-revision` suffix on the version. Filenames from the
//! version-embedded generation (`php8.3-cli_darwin-arm64.tar.gz`,
//! `php8.3-redis6.0.2_darwin-arm64.tar.gz`) are accepted by [`ArchiveName::parse`]
//! as a fallback but are never produced.

use std::sync::LazyLock;

use regex::Regex;

use crate::{NameError, PackageName, Platform, Version, unit::CoreVariant};

/// Extension of every archive written by the packager.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

/// Extensions accepted when reading (`.tar.gz` for the legacy generation).
const READ_EXTENSIONS: &[&str] = &[".tar.zst", ".tar.gz", ".tgz"];

static COMPAT_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^php(\d+\.\d+)-(.+)$").ok());

static COMPAT_EXTENSION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([a-z][a-z_]*?)(\d[a-z0-9.+-]*)$").ok());

/// The `(name, version, platform)` triple encoded in an archive filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveName {
    /// Package name.
    pub name: PackageName,
    /// Package version.
    pub version: Version,
    /// Target platform.
    pub platform: Platform,
}

impl ArchiveName {
    /// Build a name that is guaranteed to round-trip through
    /// [`ArchiveName::parse`].
    ///
    /// # Errors
    ///
    /// Returns [`NameError::InvalidPackageName`] or
    /// [`NameError::InvalidVersion`] if a component cannot be encoded.
    pub fn new(name: PackageName, version: Version, platform: Platform) -> Result<Self, NameError> {
        if !name.is_valid() {
            return Err(NameError::InvalidPackageName(name.to_string()));
        }
        validate_version(&version)?;
        Ok(Self {
            name,
            version,
            platform,
        })
    }

    /// Canonical archive filename.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{ARCHIVE_EXTENSION}",
            self.name, self.version, self.platform
        )
    }

    /// Filename of the checksum sidecar.
    pub fn sidecar_name(&self) -> String {
        format!("{}.sha256", self.file_name())
    }

    /// Recover the triple from a filename (a bare name or a path's final
    /// component).
    ///
    /// The canonical grammar is tried first; the compat grammar only runs
    /// when the canonical split does not yield a version starting with a
    /// digit.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::UnrecognizedFilename`] if neither grammar
    /// matches.
    pub fn parse(file_name: &str) -> Result<Self, NameError> {
        let unrecognized = || NameError::UnrecognizedFilename(file_name.to_string());

        let base = file_name.rsplit('/').next().unwrap_or(file_name);
        let stem = READ_EXTENSIONS
            .iter()
            .find_map(|ext| base.strip_suffix(ext))
            .ok_or_else(unrecognized)?;

        let (rest, platform) = split_platform(stem).ok_or_else(unrecognized)?;

        parse_canonical(rest, &platform)
            .or_else(|| parse_compat(rest, &platform))
            .ok_or_else(unrecognized)
    }

    /// Whether `file_name` looks like an archive this crate can read.
    pub fn is_archive_file(file_name: &str) -> bool {
        READ_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext))
    }
}

impl std::fmt::Display for ArchiveName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

fn validate_version(version: &Version) -> Result<(), NameError> {
    let invalid = |reason| NameError::InvalidVersion {
        version: version.to_string(),
        reason,
    };

    if !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("must start with a digit"));
    }
    if version.contains(['_', '/']) || version.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain '_', '/' or whitespace"));
    }
    Ok(())
}

/// Split off the trailing `_{platform}`. Legacy filenames may spell the
/// arch `x86_64`, so the last two underscores are both tried.
fn split_platform(stem: &str) -> Option<(&str, Platform)> {
    stem.rmatch_indices('_').take(2).find_map(|(idx, _)| {
        let platform = stem[idx + 1..].parse::<Platform>().ok()?;
        Some((&stem[..idx], platform))
    })
}

fn parse_canonical(rest: &str, platform: &Platform) -> Option<ArchiveName> {
    let (name, version) = rest.rsplit_once('_')?;
    ArchiveName::new(PackageName::new(name), Version::new(version), platform.clone()).ok()
}

fn parse_compat(rest: &str, platform: &Platform) -> Option<ArchiveName> {
    let caps = COMPAT_PREFIX.as_ref()?.captures(rest)?;
    let php = &caps[1];
    let tail = caps[2].to_lowercase();

    let (name, version) = if tail.parse::<CoreVariant>().is_ok() {
        (format!("php{php}-{tail}"), php.to_string())
    } else {
        let ext = COMPAT_EXTENSION.as_ref()?.captures(&tail)?;
        (format!("php{php}-{}", &ext[1]), ext[2].to_string())
    };

    ArchiveName::new(PackageName::new(&name), Version::new(&version), platform.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arch;

    fn darwin_arm() -> Platform {
        Platform::new("darwin", Arch::Arm64).unwrap()
    }

    #[test]
    fn test_canonical_round_trip() {
        let name = ArchiveName::new(
            PackageName::new("php8.3-pdo_sqlite"),
            Version::new("8.3.14"),
            darwin_arm(),
        )
        .unwrap();
        assert_eq!(name.file_name(), "php8.3-pdo_sqlite_8.3.14_darwin-arm64.tar.zst");
        assert_eq!(ArchiveName::parse(&name.file_name()).unwrap(), name);
    }

    #[test]
    fn test_revision_suffix_is_part_of_version() {
        let parsed = ArchiveName::parse("openssl_3.4.0-2_linux-amd64.tar.zst").unwrap();
        assert_eq!(parsed.name, "openssl");
        assert_eq!(parsed.version, "3.4.0-2");
        assert_eq!(parsed.platform.to_string(), "linux-amd64");
    }

    #[test]
    fn test_legacy_arch_spelling() {
        let parsed = ArchiveName::parse("zlib_1.3.1_darwin-x86_64.tar.gz").unwrap();
        assert_eq!(parsed.name, "zlib");
        assert_eq!(parsed.version, "1.3.1");
        assert_eq!(parsed.platform.to_string(), "darwin-amd64");
    }

    #[test]
    fn test_compat_core_filename() {
        let parsed = ArchiveName::parse("php8.3-cli_darwin-arm64.tar.gz").unwrap();
        assert_eq!(parsed.name, "php8.3-cli");
        assert_eq!(parsed.version, "8.3");
    }

    #[test]
    fn test_compat_extension_filename() {
        let parsed = ArchiveName::parse("php8.3-redis6.0.2_darwin-arm64.tar.gz").unwrap();
        assert_eq!(parsed.name, "php8.3-redis");
        assert_eq!(parsed.version, "6.0.2");
        assert_eq!(parsed.platform, darwin_arm());
    }

    #[test]
    fn test_new_rejects_unencodable_versions() {
        let p = darwin_arm();
        assert!(ArchiveName::new("foo".into(), "1_0".into(), p.clone()).is_err());
        assert!(ArchiveName::new("foo".into(), "v1.0".into(), p.clone()).is_err());
        assert!(ArchiveName::new("foo/bar".into(), "1.0".into(), p).is_err());
    }

    #[test]
    fn test_unrecognized() {
        assert!(ArchiveName::parse("README.md").is_err());
        assert!(ArchiveName::parse("foo_darwin-arm64.tar.zst").is_err());
        assert!(ArchiveName::parse("foo_1.0_plan9.tar.zst").is_err());
    }

    #[test]
    fn test_parse_accepts_paths() {
        let parsed = ArchiveName::parse("dist/darwin-arm64/foo_1.2.0_darwin-arm64.tar.zst").unwrap();
        assert_eq!(parsed.name, "foo");
    }
}
