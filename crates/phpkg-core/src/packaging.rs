//! Package model and archive writer.
//!
//! Turns a unit's staged files into a [`Package`] (manifest + file list) and
//! serializes it as `{name}_{version}_{platform}.tar.zst`:
//!
//! ```text
//! .phpkg/manifest.json
//! .phpkg/files
//! <files in sorted order>
//! ```
//!
//! Headers are normalized (mtime 0, uid/gid 0, no user/group names) and the
//! manifest has no timestamps, so packaging the same staged tree twice
//! produces byte-identical archives.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use phpkg_schema::{
    ArchiveName, BuildUnit, ExtensionInfo, GZIP_MAGIC, NameError, PackageManifest, Platform,
    Sha256Digest, UnitKind, Version, ZSTD_MAGIC,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::markers::write_atomic;

/// zstd level used for every archive.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Path of the manifest inside an archive.
pub const MANIFEST_PATH: &str = ".phpkg/manifest.json";

/// Path of the newline-separated file list inside an archive.
pub const FILES_PATH: &str = ".phpkg/files";

/// Errors raised while packaging or reading archives.
#[derive(Error, Debug)]
pub enum PackageError {
    /// A staged path is outside the staging root or not representable.
    #[error("staged path {} is not inside {}", path.display(), root.display())]
    InvalidStagingPath {
        /// The offending path.
        path: PathBuf,
        /// The staging root.
        root: PathBuf,
    },

    /// A regular package has no files.
    #[error("package '{0}' has no staged files")]
    EmptyPackage(String),

    /// A meta-package has files.
    #[error("meta-package '{name}' must not contain files, found {count}")]
    MetaWithFiles {
        /// Package name.
        name: String,
        /// Number of staged files.
        count: usize,
    },

    /// The archive has no embedded manifest.
    #[error("{} has no {MANIFEST_PATH}", .0.display())]
    MissingManifest(PathBuf),

    /// The archive digest does not match its sidecar.
    #[error("checksum mismatch for {}: sidecar {expected}, actual {actual}", path.display())]
    ChecksumMismatch {
        /// Archive path.
        path: PathBuf,
        /// Digest from the sidecar.
        expected: Sha256Digest,
        /// Digest of the archive bytes.
        actual: Sha256Digest,
    },

    /// The filename and the embedded manifest disagree.
    #[error("{} does not match its manifest ({expected})", path.display())]
    NameMismatch {
        /// Archive path.
        path: PathBuf,
        /// Filename derived from the manifest.
        expected: String,
    },

    /// The archive is neither zstd nor gzip compressed.
    #[error("{} is not a .tar.zst or .tar.gz archive", .0.display())]
    UnknownFormat(PathBuf),

    /// Name, version or platform cannot be encoded.
    #[error(transparent)]
    Naming(#[from] NameError),

    /// I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization failure.
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),

    /// A unit's `license_file` is not a valid glob.
    #[error("invalid license pattern '{pattern}': {source}")]
    LicensePattern {
        /// Pattern from the catalog.
        pattern: String,
        /// Parse failure.
        #[source]
        source: glob::PatternError,
    },
}

/// Files a build left behind for packaging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedFiles {
    /// Directory every file must live under.
    pub root: PathBuf,
    /// Absolute paths of staged files and symlinks.
    pub files: Vec<PathBuf>,
}

/// Where staged files come from after a build.
pub trait ArtifactSource: Send + Sync {
    /// Collect the staged files of `unit`.
    ///
    /// # Errors
    ///
    /// Returns a [`PackageError`] if the staged tree cannot be read.
    fn staged_files(&self, unit: &BuildUnit) -> Result<StagedFiles, PackageError>;
}

/// Reads `<stage_root>/<unit>/` recursively.
#[derive(Debug, Clone)]
pub struct StagingDirSource {
    stage_root: PathBuf,
}

impl StagingDirSource {
    /// Source over `stage_root` (one subdirectory per unit).
    pub fn new(stage_root: impl Into<PathBuf>) -> Self {
        Self {
            stage_root: stage_root.into(),
        }
    }

    /// Staging directory of `unit`.
    pub fn unit_dir(&self, unit: &BuildUnit) -> PathBuf {
        self.stage_root.join(unit.name.file_stem())
    }
}

impl ArtifactSource for StagingDirSource {
    fn staged_files(&self, unit: &BuildUnit) -> Result<StagedFiles, PackageError> {
        let root = self.unit_dir(unit);
        let mut files = Vec::new();

        if root.is_dir() {
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| {
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop in staging dir"))
                })?;
                let ft = entry.file_type();
                if ft.is_file() || ft.is_symlink() {
                    files.push(entry.into_path());
                }
            }
        }

        Ok(StagedFiles { root, files })
    }
}

/// A package ready to be written: manifest plus `(archive path, source
/// path)` pairs in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// The manifest that will be embedded.
    pub manifest: PackageManifest,
    /// Source file for each entry of `manifest.files`, same order.
    pub sources: Vec<PathBuf>,
}

/// A written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArchive {
    /// Encoded name.
    pub name: ArchiveName,
    /// Archive path.
    pub path: PathBuf,
    /// Digest of the archive bytes.
    pub sha256: Sha256Digest,
    /// Archive size in bytes.
    pub size: u64,
    /// Embedded manifest.
    pub manifest: PackageManifest,
}

/// Build the package of `unit` from its staged files.
///
/// Paths are normalized to `/`-separated paths relative to the staging root
/// and sorted; sizes of regular files are summed into `installed_size`.
///
/// # Errors
///
/// - [`PackageError::InvalidStagingPath`] for files outside the root or
///   paths with `..`,
/// - [`PackageError::EmptyPackage`] / [`PackageError::MetaWithFiles`] when
///   the file set does not fit the package kind,
/// - [`PackageError::Naming`] if the package name is not encodable.
pub fn build_package(
    unit: &BuildUnit,
    php_version: &Version,
    platform: &Platform,
    staged: &StagedFiles,
) -> Result<Package, PackageError> {
    let name = unit.validate_package_name(php_version)?;

    let mut entries = Vec::with_capacity(staged.files.len());
    let mut installed_size = 0u64;
    for path in &staged.files {
        let rel = relative_path(&staged.root, path)?;
        let meta = std::fs::symlink_metadata(path)?;
        if meta.is_file() {
            installed_size += meta.len();
        }
        entries.push((rel, path.clone()));
    }
    entries.sort();
    entries.dedup_by(|a, b| a.0 == b.0);

    if unit.meta && !entries.is_empty() {
        return Err(PackageError::MetaWithFiles {
            name: name.to_string(),
            count: entries.len(),
        });
    }
    if !unit.meta && entries.is_empty() {
        return Err(PackageError::EmptyPackage(name.to_string()));
    }

    let php_version = match unit.kind {
        UnitKind::Library => None,
        UnitKind::PhpCore(_) | UnitKind::Extension => {
            Some(Version::new(php_version.major_minor()))
        }
    };

    let (files, sources) = entries.into_iter().unzip();
    let manifest = PackageManifest {
        name,
        version: unit.version.clone(),
        revision: None,
        php_version,
        description: unit.description.clone(),
        platform: platform.clone(),
        depends: unit.depends.clone(),
        conflicts: unit.conflicts.clone(),
        provides: unit.provides.clone(),
        installed_size,
        files,
        extension: unit.extension.clone(),
    };

    // The archive name must be encodable before anything is written.
    manifest.archive_name()?;

    Ok(Package { manifest, sources })
}

fn relative_path(root: &Path, path: &Path) -> Result<String, PackageError> {
    let invalid = || PackageError::InvalidStagingPath {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };

    let rel = path.strip_prefix(root).map_err(|_| invalid())?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid());
            }
        }
    }
    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join("/"))
}

/// Write the `conf.d` snippet that loads an extension into its staging
/// directory, under `{prefix}/etc/php/conf.d/`.
///
/// An existing snippet (installed by the build itself) is left alone.
/// Returns the path of the snippet that was written.
///
/// # Errors
///
/// Returns an I/O error if the snippet cannot be written.
pub fn stage_extension_ini(
    unit_stage_dir: &Path,
    prefix: &str,
    info: &ExtensionInfo,
) -> std::io::Result<Option<PathBuf>> {
    let conf_dir = unit_stage_dir
        .join(prefix.trim_start_matches('/'))
        .join("etc/php/conf.d");
    let path = conf_dir.join(info.ini_file_name());
    if path.exists() {
        return Ok(None);
    }
    std::fs::create_dir_all(&conf_dir)?;
    std::fs::write(&path, info.ini_contents())?;
    Ok(Some(path))
}

/// Copy the license files matching `pattern` out of a unit's work
/// directory into `{prefix}/share/licenses/{package}/` of its staging
/// directory.
///
/// The pattern is matched against the work directory first, then against
/// each directory directly below it (where source tarballs unpack).
/// Returns the staged paths, empty when nothing matched.
///
/// # Errors
///
/// Returns [`PackageError::LicensePattern`] for a malformed pattern and
/// [`PackageError::Io`] if a file cannot be copied.
pub fn stage_license(
    work_dir: &Path,
    unit_stage_dir: &Path,
    prefix: &str,
    package: &str,
    pattern: &str,
) -> Result<Vec<PathBuf>, PackageError> {
    let base = glob::Pattern::escape(&work_dir.to_string_lossy());
    let mut found = find_files(&format!("{base}/{pattern}"), pattern)?;
    if found.is_empty() {
        found = find_files(&format!("{base}/*/{pattern}"), pattern)?;
    }

    let dest_dir = unit_stage_dir
        .join(prefix.trim_start_matches('/'))
        .join("share/licenses")
        .join(package);
    let mut staged = Vec::with_capacity(found.len());
    for source in found {
        let Some(name) = source.file_name() else {
            continue;
        };
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(name);
        std::fs::copy(&source, &dest)?;
        debug!(from = %source.display(), to = %dest.display(), "staged license");
        staged.push(dest);
    }
    Ok(staged)
}

fn find_files(full: &str, pattern: &str) -> Result<Vec<PathBuf>, PackageError> {
    let paths = glob::glob(full).map_err(|source| PackageError::LicensePattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(paths.filter_map(Result::ok).filter(|p| p.is_file()).collect())
}

/// Counts and hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

fn file_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            return 0o755;
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    0o644
}

/// Write `package` into `dist_dir` as a `.tar.zst` plus `.sha256` sidecar.
///
/// Both files are written to temp files and renamed into place.
///
/// # Errors
///
/// Returns a [`PackageError`] if a staged file cannot be read or the
/// output cannot be written.
pub fn write_package(package: &Package, dist_dir: &Path) -> Result<PackagedArchive, PackageError> {
    let manifest = &package.manifest;
    let name = manifest.archive_name()?;
    std::fs::create_dir_all(dist_dir)?;
    let path = dist_dir.join(name.file_name());

    let tmp = tempfile::NamedTempFile::new_in(dist_dir)?;
    let writer = HashingWriter {
        inner: BufWriter::new(tmp.as_file().try_clone()?),
        hasher: Sha256::new(),
        written: 0,
    };
    let encoder = zstd::stream::Encoder::new(writer, COMPRESSION_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let manifest_json = manifest.to_json()?;
    let mut h = header(manifest_json.len() as u64, 0o644);
    builder.append_data(&mut h, MANIFEST_PATH, manifest_json.as_slice())?;

    let mut file_list = manifest.files.join("\n");
    file_list.push('\n');
    let mut h = header(file_list.len() as u64, 0o644);
    builder.append_data(&mut h, FILES_PATH, file_list.as_bytes())?;

    for (rel, source) in manifest.files.iter().zip(&package.sources) {
        let meta = std::fs::symlink_metadata(source)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(source)?;
            let mut h = header(0, 0o777);
            h.set_entry_type(tar::EntryType::Symlink);
            builder.append_link(&mut h, rel, target)?;
        } else {
            let mut h = header(meta.len(), file_mode(&meta));
            builder.append_data(&mut h, rel, File::open(source)?)?;
        }
    }

    builder.finish()?;
    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    let sha256 = Sha256Digest::from_hasher(writer.hasher);
    let size = writer.written;
    drop(writer.inner);

    tmp.persist(&path).map_err(|e| e.error)?;
    write_atomic(
        &dist_dir.join(name.sidecar_name()),
        format!("{sha256}\n").as_bytes(),
    )?;

    info!(archive = %path.display(), sha256 = %sha256, size, "package written");
    Ok(PackagedArchive {
        name,
        path,
        sha256,
        size,
        manifest: manifest.clone(),
    })
}

/// Open an archive as a tar stream, detecting zstd or gzip by magic bytes.
fn open_tar(path: &Path) -> Result<tar::Archive<Box<dyn Read>>, PackageError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let n = file.read(&mut magic)?;
    let file = File::open(path)?;

    let reader: Box<dyn Read> = if n >= 4 && magic == ZSTD_MAGIC {
        Box::new(zstd::stream::Decoder::new(file)?)
    } else if n >= 2 && magic[..2] == GZIP_MAGIC {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        return Err(PackageError::UnknownFormat(path.to_path_buf()));
    };
    Ok(tar::Archive::new(reader))
}

/// Read the manifest embedded in an archive (`.tar.zst` or legacy
/// `.tar.gz`).
///
/// # Errors
///
/// Returns [`PackageError::MissingManifest`] if there is none and
/// [`PackageError::Json`] if it does not parse.
pub fn read_manifest(path: &Path) -> Result<PackageManifest, PackageError> {
    let mut archive = open_tar(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_string_lossy().into_owned();
        let entry_path = entry_path.trim_start_matches("./");
        if entry_path == MANIFEST_PATH || entry_path == "manifest.json" {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(PackageManifest::from_json(&bytes)?);
        }
    }
    Err(PackageError::MissingManifest(path.to_path_buf()))
}

/// Stream a file through SHA-256.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn sha256_file(path: &Path) -> std::io::Result<(Sha256Digest, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((Sha256Digest::from_hasher(hasher), size))
}

/// Sidecar path of an archive (`<archive>.sha256`).
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Read a sidecar digest, if the sidecar exists.
///
/// # Errors
///
/// Returns an error if the sidecar exists but is unreadable or malformed.
pub fn read_sidecar(archive: &Path) -> Result<Option<Sha256Digest>, PackageError> {
    match std::fs::read_to_string(sidecar_path(archive)) {
        Ok(text) => Ok(Some(Sha256Digest::new(text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Result of [`verify_archive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArchive {
    /// Embedded manifest.
    pub manifest: PackageManifest,
    /// Digest of the archive bytes.
    pub sha256: Sha256Digest,
    /// Whether a sidecar was present and matched.
    pub sidecar_checked: bool,
    /// Archive size in bytes.
    pub size: u64,
}

/// Recompute an archive's digest, compare it with the sidecar (when
/// present), parse the manifest and check that the filename matches it.
///
/// # Errors
///
/// Returns [`PackageError::ChecksumMismatch`],
/// [`PackageError::NameMismatch`] or any read error.
pub fn verify_archive(path: &Path) -> Result<VerifiedArchive, PackageError> {
    let (actual, size) = sha256_file(path)?;
    let expected = read_sidecar(path)?;
    if let Some(expected) = &expected {
        if *expected != actual {
            return Err(PackageError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    let manifest = read_manifest(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let from_name = ArchiveName::parse(&file_name)?;
    let from_manifest = manifest.archive_name()?;
    if from_name != from_manifest {
        return Err(PackageError::NameMismatch {
            path: path.to_path_buf(),
            expected: from_manifest.file_name(),
        });
    }

    debug!(archive = %path.display(), "archive verified");
    Ok(VerifiedArchive {
        manifest,
        sha256: actual,
        sidecar_checked: expected.is_some(),
        size,
    })
}

/// Post-build stage run by the executor: package a unit's staged files
/// into the dist directory.
pub struct PackageStage {
    source: Arc<dyn ArtifactSource>,
    dist_dir: PathBuf,
    php_version: Version,
    platform: Platform,
}

impl std::fmt::Debug for PackageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStage")
            .field("dist_dir", &self.dist_dir)
            .field("php_version", &self.php_version)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl PackageStage {
    /// Stage reading from `source` and writing into `dist_dir`.
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        dist_dir: impl Into<PathBuf>,
        php_version: Version,
        platform: Platform,
    ) -> Self {
        Self {
            source,
            dist_dir: dist_dir.into(),
            php_version,
            platform,
        }
    }

    /// Stage over the configured staging and dist directories.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            Arc::new(StagingDirSource::new(config.paths.stage_dir())),
            config.paths.dist_dir(),
            config.php_version.clone(),
            config.platform.clone(),
        )
    }

    /// Package `unit`, or return `None` if it does not publish.
    ///
    /// # Errors
    ///
    /// Returns a [`PackageError`] from collecting, building or writing.
    pub fn package_unit(&self, unit: &BuildUnit) -> Result<Option<PackagedArchive>, PackageError> {
        if !unit.publishes() {
            debug!(unit = %unit.name, "unit is not published, skipping packaging");
            return Ok(None);
        }
        let staged = self.source.staged_files(unit)?;
        let package = build_package(unit, &self.php_version, &self.platform, &staged)?;
        write_package(&package, &self.dist_dir).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phpkg_schema::{Arch, CoreVariant, Dependency};

    fn platform() -> Platform {
        Platform::new("darwin", Arch::Arm64).unwrap()
    }

    fn redis() -> BuildUnit {
        let mut unit = BuildUnit::new("ext:redis", UnitKind::Extension, "6.1.0");
        unit.description = "Redis client".to_string();
        unit.depends = vec![Dependency::any("php8.3-common")];
        unit.extension = Some(ExtensionInfo {
            name: "redis".to_string(),
            zend: false,
            priority: 30,
        });
        unit
    }

    fn stage(root: &Path, files: &[(&str, &str)]) -> StagedFiles {
        let mut paths = Vec::new();
        for (rel, content) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            paths.push(path);
        }
        StagedFiles {
            root: root.to_path_buf(),
            files: paths,
        }
    }

    #[test]
    fn test_build_package_normalizes_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = stage(
            tmp.path(),
            &[
                ("usr/local/lib/php/extensions/redis.so", "12345"),
                ("usr/local/etc/php/conf.d/30-redis.ini", "extension=redis.so\n"),
            ],
        );

        let pkg = build_package(&redis(), &Version::new("8.3.14"), &platform(), &staged).unwrap();
        assert_eq!(pkg.manifest.name, "php8.3-redis");
        assert_eq!(pkg.manifest.php_version.as_ref().unwrap(), &"8.3");
        assert_eq!(
            pkg.manifest.files,
            vec![
                "usr/local/etc/php/conf.d/30-redis.ini".to_string(),
                "usr/local/lib/php/extensions/redis.so".to_string(),
            ]
        );
        assert_eq!(pkg.manifest.installed_size, 5 + 19);
    }

    #[test]
    fn test_build_package_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = StagedFiles {
            root: tmp.path().join("stage"),
            files: vec![tmp.path().join("stage/../etc/passwd")],
        };
        assert!(matches!(
            build_package(&redis(), &Version::new("8.3"), &platform(), &staged),
            Err(PackageError::InvalidStagingPath { .. }) | Err(PackageError::Io(_))
        ));

        let outside = StagedFiles {
            root: tmp.path().join("stage"),
            files: vec![PathBuf::from("/etc/hosts")],
        };
        assert!(matches!(
            build_package(&redis(), &Version::new("8.3"), &platform(), &outside),
            Err(PackageError::InvalidStagingPath { .. })
        ));
    }

    #[test]
    fn test_empty_and_meta_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = StagedFiles {
            root: tmp.path().to_path_buf(),
            files: vec![],
        };
        assert!(matches!(
            build_package(&redis(), &Version::new("8.3"), &platform(), &empty),
            Err(PackageError::EmptyPackage(_))
        ));

        let mut meta = BuildUnit::new("php", UnitKind::PhpCore(CoreVariant::Cli), "8.3.14");
        meta.meta = true;
        meta.package_name = Some("php8.3".into());
        let pkg = build_package(&meta, &Version::new("8.3"), &platform(), &empty).unwrap();
        assert!(pkg.manifest.is_meta());

        let staged = stage(tmp.path(), &[("bin/php", "x")]);
        assert!(matches!(
            build_package(&meta, &Version::new("8.3"), &platform(), &staged),
            Err(PackageError::MetaWithFiles { count: 1, .. })
        ));
    }

    #[test]
    fn test_write_is_reproducible_and_verifiable() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = stage(
            &tmp.path().join("stage"),
            &[("usr/local/lib/php/extensions/redis.so", "binary")],
        );
        let pkg = build_package(&redis(), &Version::new("8.3.14"), &platform(), &staged).unwrap();

        let first = write_package(&pkg, &tmp.path().join("a")).unwrap();
        let second = write_package(&pkg, &tmp.path().join("b")).unwrap();
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(
            std::fs::read(&first.path).unwrap(),
            std::fs::read(&second.path).unwrap()
        );
        assert_eq!(
            first.path.file_name().unwrap(),
            "php8.3-redis_6.1.0_darwin-arm64.tar.zst"
        );

        let sidecar = std::fs::read_to_string(sidecar_path(&first.path)).unwrap();
        assert_eq!(sidecar.trim(), first.sha256.as_str());

        let verified = verify_archive(&first.path).unwrap();
        assert!(verified.sidecar_checked);
        assert_eq!(verified.manifest, pkg.manifest);
        assert_eq!(read_manifest(&first.path).unwrap(), pkg.manifest);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = stage(&tmp.path().join("stage"), &[("lib/redis.so", "binary")]);
        let pkg = build_package(&redis(), &Version::new("8.3.14"), &platform(), &staged).unwrap();
        let archive = write_package(&pkg, &tmp.path().join("dist")).unwrap();

        std::fs::write(sidecar_path(&archive.path), format!("{}\n", "0".repeat(64))).unwrap();
        assert!(matches!(
            verify_archive(&archive.path),
            Err(PackageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_read_legacy_gzip_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("php8.3-redis6.0.2_darwin-arm64.tar.gz");

        let manifest = PackageManifest {
            name: "php8.3-redis".into(),
            version: "6.0.2".into(),
            revision: None,
            php_version: None,
            description: String::new(),
            platform: platform(),
            depends: vec![],
            conflicts: vec![],
            provides: vec![],
            installed_size: 0,
            files: vec![],
            extension: None,
        };
        let json = manifest.to_json().unwrap();

        let gz = flate2::write::GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut h = header(json.len() as u64, 0o644);
        builder.append_data(&mut h, "./manifest.json", json.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert_eq!(read_manifest(&path).unwrap(), manifest);
    }

    #[test]
    fn test_stage_extension_ini() {
        let tmp = tempfile::tempdir().unwrap();
        let info = ExtensionInfo {
            name: "xdebug".to_string(),
            zend: true,
            priority: 15,
        };

        let path = stage_extension_ini(tmp.path(), "/usr/local", &info)
            .unwrap()
            .unwrap();
        assert_eq!(path, tmp.path().join("usr/local/etc/php/conf.d/15-xdebug.ini"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "zend_extension=xdebug.so\n"
        );
        assert!(stage_extension_ini(tmp.path(), "/usr/local", &info).unwrap().is_none());
    }

    #[test]
    fn test_stage_license_from_unpacked_source() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let stage = tmp.path().join("stage");
        std::fs::create_dir_all(work.join("redis-6.1.0/src")).unwrap();
        std::fs::write(work.join("redis-6.1.0/COPYING"), "BSD").unwrap();
        std::fs::write(work.join("redis-6.1.0/src/COPYING"), "nested").unwrap();

        let staged = stage_license(&work, &stage, "/usr/local", "php8.3-redis", "COPYING*").unwrap();
        let dest = stage.join("usr/local/share/licenses/php8.3-redis/COPYING");
        assert_eq!(staged, vec![dest.clone()]);
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "BSD");

        assert!(stage_license(&work, &stage, "/usr/local", "x", "LICENSE").unwrap().is_empty());
        assert!(matches!(
            stage_license(&work, &stage, "/usr/local", "x", "[LICENSE"),
            Err(PackageError::LicensePattern { .. })
        ));
    }

    #[test]
    fn test_staging_dir_source_walks_unit_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let source = StagingDirSource::new(tmp.path());
        let unit = redis();
        let dir = source.unit_dir(&unit);
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::write(dir.join("lib/redis.so"), "x").unwrap();

        let staged = source.staged_files(&unit).unwrap();
        assert_eq!(staged.root, tmp.path().join("ext%3aredis"));
        assert_eq!(staged.files, vec![dir.join("lib/redis.so")]);
    }
}
