//! Collect packages from a local directory of archives.

use std::path::Path;

use phpkg_schema::ArchiveName;
use tracing::{debug, warn};

use super::{IndexError, IndexedPackage, join_url};
use crate::packaging::{read_manifest, read_sidecar, sha256_file};

/// Scan `dir` for archives and turn each into an index entry.
///
/// The manifest embedded in each archive is authoritative; archives whose
/// manifest cannot be read are skipped with a warning. The digest comes
/// from the `.sha256` sidecar when present and is computed otherwise.
/// Download URLs are `{base_url}/{file name}`.
///
/// # Errors
///
/// Returns [`IndexError::Io`] if the directory cannot be listed or an
/// archive cannot be hashed.
pub fn collect_local(dir: &Path, base_url: &str) -> Result<Vec<IndexedPackage>, IndexError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?.to_string();
            ArchiveName::is_archive_file(&name).then_some((name, p))
        })
        .collect();
    files.sort();

    let mut packages = Vec::with_capacity(files.len());
    for (file_name, path) in files {
        let manifest = match read_manifest(&path) {
            Ok(m) => m,
            Err(e) => {
                let err = IndexError::MalformedManifest {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                };
                warn!("skipping package: {err}");
                continue;
            }
        };

        let (computed, size) = sha256_file(&path)?;
        let sha256 = match read_sidecar(&path) {
            Ok(Some(sidecar)) if sidecar == computed => sidecar,
            Ok(Some(sidecar)) => {
                warn!(archive = %file_name, sidecar = %sidecar, actual = %computed, "sidecar digest does not match archive, using actual");
                computed
            }
            Ok(None) => computed,
            Err(e) => {
                warn!(archive = %file_name, error = %e, "unreadable sidecar, using computed digest");
                computed
            }
        };

        debug!(archive = %file_name, name = %manifest.name, version = %manifest.version, "indexed");
        packages.push(IndexedPackage::from_manifest(
            manifest,
            join_url(base_url, &file_name),
            sha256,
            size,
        ));
    }

    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::build_index;
    use crate::packaging::{StagedFiles, build_package, write_package};
    use phpkg_schema::{BuildUnit, Platform, UnitKind, Version};

    fn write_archive(dist: &Path, stage: &Path, name: &str, version: &str, platform: &str) {
        let unit = BuildUnit::new(name, UnitKind::Library, version);
        let file = stage.join(format!("{name}-{version}-{platform}/lib/lib{name}.a"));
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, format!("{name} {version}")).unwrap();
        let staged = StagedFiles {
            root: file.parent().unwrap().parent().unwrap().to_path_buf(),
            files: vec![file],
        };
        let platform: Platform = platform.parse().unwrap();
        let pkg = build_package(&unit, &Version::new("8.3"), &platform, &staged).unwrap();
        write_package(&pkg, dist).unwrap();
    }

    #[test]
    fn test_collect_and_deduplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let dist = tmp.path().join("dist");
        let stage = tmp.path().join("stage");
        write_archive(&dist, &stage, "foo", "1.2.0", "darwin-arm64");
        write_archive(&dist, &stage, "foo", "1.3.0", "darwin-arm64");
        write_archive(&dist, &stage, "foo", "1.2.0", "darwin-amd64");

        let packages = collect_local(&dist, "https://dl.example.com/v1/").unwrap();
        assert_eq!(packages.len(), 3);

        let doc = build_index(packages, "1970-01-01T00:00:00Z");
        let arm = doc.find("darwin-arm64", "foo").unwrap();
        assert_eq!(arm.version, "1.3.0");
        assert_eq!(arm.url, "https://dl.example.com/v1/foo_1.3.0_darwin-arm64.tar.zst");
        assert_eq!(doc.find("darwin-amd64", "foo").unwrap().version, "1.2.0");
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_malformed_manifest_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dist = tmp.path().join("dist");
        write_archive(&dist, &tmp.path().join("stage"), "zlib", "1.3.1", "darwin-arm64");

        // A manifest without `platform`.
        let json = br#"{"name":"broken","version":"1.0","description":"","installed_size":0,"files":[]}"#;
        let path = dist.join("broken_1.0_darwin-arm64.tar.zst");
        let encoder = zstd::stream::Encoder::new(std::fs::File::create(&path).unwrap(), 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, ".phpkg/manifest.json", json.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        std::fs::write(dist.join("README.txt"), "not an archive").unwrap();

        let packages = collect_local(&dist, "").unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].entry.name, "zlib");
    }

    #[test]
    fn test_digest_without_sidecar_is_computed() {
        let tmp = tempfile::tempdir().unwrap();
        let dist = tmp.path().join("dist");
        write_archive(&dist, &tmp.path().join("stage"), "zlib", "1.3.1", "darwin-arm64");
        let archive = dist.join("zlib_1.3.1_darwin-arm64.tar.zst");
        let (expected, size) = sha256_file(&archive).unwrap();
        std::fs::remove_file(dist.join("zlib_1.3.1_darwin-arm64.tar.zst.sha256")).unwrap();

        let packages = collect_local(&dist, "").unwrap();
        assert_eq!(packages[0].entry.sha256, expected);
        assert_eq!(packages[0].entry.size, size);
    }
}
