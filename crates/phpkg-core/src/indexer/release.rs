//! Collect packages from the assets of a GitHub-style release.
//!
//! `GET {api_base}/repos/{repo}/releases/tags/{tag}` lists the assets. Each
//! archive asset is matched with its `.sha256` sidecar asset; unless the
//! collection is shallow, the archive is downloaded to read its embedded
//! manifest. Archives are fetched with bounded concurrency.

use std::collections::HashMap;
use std::io::Write;

use futures::stream::{self, StreamExt};
use phpkg_schema::{ArchiveName, IndexEntry, Sha256Digest};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{IndexError, IndexedPackage};
use crate::packaging::read_manifest;

/// Default number of concurrent archive downloads.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// A release as returned by the releases API.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    /// Release tag.
    pub tag_name: String,
    /// Uploaded files.
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// One uploaded file of a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    /// File name.
    pub name: String,
    /// Public download URL.
    pub browser_download_url: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// How [`collect_release`] treats each asset.
#[derive(Debug, Clone)]
pub struct ReleaseOptions {
    /// Do not download archives; build entries from filenames and sidecars.
    pub shallow: bool,
    /// Concurrent downloads.
    pub concurrency: usize,
    /// Bearer token for the API.
    pub token: Option<String>,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            shallow: false,
            concurrency: DEFAULT_CONCURRENCY,
            token: None,
        }
    }
}

fn authorized(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

/// Fetch one release by tag.
///
/// # Errors
///
/// Returns [`IndexError::Http`] if the request fails or the release does
/// not exist.
pub async fn fetch_release(
    client: &Client,
    api_base: &str,
    repo: &str,
    tag: &str,
    token: Option<&str>,
) -> Result<Release, IndexError> {
    let url = format!(
        "{}/repos/{repo}/releases/tags/{tag}",
        api_base.trim_end_matches('/')
    );
    debug!(url = %url, "fetching release");
    let resp = authorized(
        client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json"),
        token,
    )
    .send()
    .await?
    .error_for_status()?;
    Ok(resp.json().await?)
}

/// Collect index entries from the release `tag` of `repo`.
///
/// Assets whose names are not archives are ignored. Archives that cannot be
/// parsed, lack a digest in shallow mode, or carry an unreadable manifest
/// are skipped with a warning. A sidecar that cannot be fetched only
/// matters in shallow mode; otherwise the digest of the download is used.
///
/// # Errors
///
/// Returns [`IndexError::Http`] only if the release listing itself fails.
pub async fn collect_release(
    client: &Client,
    api_base: &str,
    repo: &str,
    tag: &str,
    options: &ReleaseOptions,
) -> Result<Vec<IndexedPackage>, IndexError> {
    let release = fetch_release(client, api_base, repo, tag, options.token.as_deref()).await?;
    info!(tag = %release.tag_name, assets = release.assets.len(), "release listed");

    let sidecars: HashMap<&str, &ReleaseAsset> = release
        .assets
        .iter()
        .filter_map(|a| a.name.strip_suffix(".sha256").map(|archive| (archive, a)))
        .collect();

    let archives: Vec<&ReleaseAsset> = release
        .assets
        .iter()
        .filter(|a| ArchiveName::is_archive_file(&a.name))
        .collect();

    let results: Vec<(String, Result<IndexedPackage, IndexError>)> = stream::iter(archives)
        .map(|asset| {
            let sidecar = sidecars.get(asset.name.as_str()).copied();
            async move {
                let result = collect_asset(client, asset, sidecar, options).await;
                (asset.name.clone(), result)
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut packages: Vec<(String, IndexedPackage)> = Vec::new();
    for (name, result) in results {
        match result {
            Ok(pkg) => packages.push((name, pkg)),
            Err(e) => warn!(asset = %name, error = %e, "skipping release asset"),
        }
    }
    packages.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(packages.into_iter().map(|(_, pkg)| pkg).collect())
}

async fn collect_asset(
    client: &Client,
    asset: &ReleaseAsset,
    sidecar: Option<&ReleaseAsset>,
    options: &ReleaseOptions,
) -> Result<IndexedPackage, IndexError> {
    let token = options.token.as_deref();
    let parsed = ArchiveName::parse(&asset.name)?;

    let sidecar_digest = match sidecar {
        Some(sidecar) => match fetch_sidecar(client, sidecar, token).await {
            Ok(digest) => Some(digest),
            Err(e) => {
                warn!(asset = %sidecar.name, error = %e, "could not read sidecar");
                None
            }
        },
        None => None,
    };

    if options.shallow {
        let sha256 = sidecar_digest.ok_or_else(|| IndexError::MalformedManifest {
            path: asset.name.clone(),
            reason: "no .sha256 sidecar asset".to_string(),
        })?;
        return Ok(IndexedPackage {
            platform: parsed.platform,
            entry: IndexEntry {
                name: parsed.name,
                version: parsed.version,
                description: String::new(),
                depends: Vec::new(),
                provides: Vec::new(),
                url: asset.browser_download_url.clone(),
                sha256,
                size: asset.size,
                installed_size: 0,
            },
        });
    }

    let bytes = authorized(client.get(&asset.browser_download_url), token)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    let downloaded = bytes.len() as u64;
    let name = asset.name.clone();

    let (computed, manifest) = tokio::task::spawn_blocking(move || {
        let computed = Sha256Digest::compute(&bytes);
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        let manifest = read_manifest(tmp.path()).map_err(|e| IndexError::MalformedManifest {
            path: name,
            reason: e.to_string(),
        })?;
        Ok::<_, IndexError>((computed, manifest))
    })
    .await
    .map_err(|e| IndexError::Io(std::io::Error::other(e)))??;

    if let Some(expected) = &sidecar_digest {
        if *expected != computed {
            warn!(asset = %asset.name, sidecar = %expected, actual = %computed, "sidecar digest does not match download, using actual");
        }
    }

    Ok(IndexedPackage::from_manifest(
        manifest,
        asset.browser_download_url.clone(),
        computed,
        downloaded,
    ))
}

async fn fetch_sidecar(
    client: &Client,
    sidecar: &ReleaseAsset,
    token: Option<&str>,
) -> Result<Sha256Digest, IndexError> {
    let text = authorized(client.get(&sidecar.browser_download_url), token)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(Sha256Digest::new(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packaging::{StagedFiles, build_package, write_package};
    use mockito::Server;
    use phpkg_schema::{BuildUnit, Platform, UnitKind, Version};

    /// Build a real archive and return (file name, bytes, sidecar text).
    fn archive(dir: &std::path::Path) -> (String, Vec<u8>, String) {
        let root = dir.join("stage");
        let file = root.join("lib/libz.a");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "zlib").unwrap();
        let mut unit = BuildUnit::new("zlib", UnitKind::Library, "1.3.1");
        unit.description = "Compression library".to_string();
        let platform: Platform = "darwin-arm64".parse().unwrap();
        let pkg = build_package(
            &unit,
            &Version::new("8.3"),
            &platform,
            &StagedFiles { root, files: vec![file] },
        )
        .unwrap();
        let written = write_package(&pkg, &dir.join("dist")).unwrap();
        (
            written.name.file_name(),
            std::fs::read(&written.path).unwrap(),
            format!("{}\n", written.sha256),
        )
    }

    fn release_json(base: &str, assets: &[(&str, u64)]) -> String {
        let assets: Vec<serde_json::Value> = assets
            .iter()
            .map(|(name, size)| {
                serde_json::json!({
                    "name": name,
                    "browser_download_url": format!("{base}/download/{name}"),
                    "size": size,
                })
            })
            .collect();
        serde_json::json!({ "tag_name": "v2024.10", "assets": assets }).to_string()
    }

    #[tokio::test]
    async fn test_collect_release_reads_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        let (file_name, bytes, sidecar) = archive(tmp.path());
        let sidecar_name = format!("{file_name}.sha256");

        let mut server = Server::new_async().await;
        let base = server.url();
        let body = release_json(
            &base,
            &[
                (file_name.as_str(), bytes.len() as u64),
                (sidecar_name.as_str(), 65),
                ("checksums.txt", 10),
                ("php8.3-cli_darwin-arm64.tar.gz", 99),
            ],
        );

        let _listing = server
            .mock("GET", "/repos/acme/php-builds/releases/tags/v2024.10")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;
        let _archive = server
            .mock("GET", format!("/download/{file_name}").as_str())
            .with_status(200)
            .with_body(bytes.clone())
            .create_async()
            .await;
        let _sidecar = server
            .mock("GET", format!("/download/{sidecar_name}").as_str())
            .with_status(200)
            .with_body(sidecar.clone())
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/download/php8.3-cli_darwin-arm64.tar.gz")
            .with_status(404)
            .create_async()
            .await;

        let options = ReleaseOptions {
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let client = Client::new();
        let packages = collect_release(&client, &base, "acme/php-builds", "v2024.10", &options)
            .await
            .unwrap();

        assert_eq!(packages.len(), 1);
        let entry = &packages[0].entry;
        assert_eq!(entry.name, "zlib");
        assert_eq!(entry.description, "Compression library");
        assert_eq!(entry.sha256.as_str(), sidecar.trim());
        assert_eq!(entry.size, bytes.len() as u64);
        assert_eq!(entry.url, format!("{base}/download/{file_name}"));
    }

    #[tokio::test]
    async fn test_shallow_uses_filenames_and_sidecars() {
        let mut server = Server::new_async().await;
        let base = server.url();
        let digest = "ab".repeat(32);
        let body = release_json(
            &base,
            &[
                ("php8.3-redis6.0.2_darwin-arm64.tar.gz", 1234),
                ("php8.3-redis6.0.2_darwin-arm64.tar.gz.sha256", 65),
                ("php8.3-apcu5.1.23_darwin-arm64.tar.gz", 99),
            ],
        );

        let _listing = server
            .mock("GET", "/repos/acme/php-builds/releases/tags/v1")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let _sidecar = server
            .mock("GET", "/download/php8.3-redis6.0.2_darwin-arm64.tar.gz.sha256")
            .with_status(200)
            .with_body(format!("{digest}  php8.3-redis6.0.2_darwin-arm64.tar.gz\n"))
            .create_async()
            .await;

        let options = ReleaseOptions {
            shallow: true,
            ..Default::default()
        };
        let packages = collect_release(&Client::new(), &base, "acme/php-builds", "v1", &options)
            .await
            .unwrap();

        // apcu has no sidecar, so only redis survives.
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        assert_eq!(pkg.platform.to_string(), "darwin-arm64");
        assert_eq!(pkg.entry.name, "php8.3-redis");
        assert_eq!(pkg.entry.version, "6.0.2");
        assert_eq!(pkg.entry.sha256.as_str(), digest);
        assert_eq!(pkg.entry.size, 1234);
    }

    #[tokio::test]
    async fn test_broken_sidecar_falls_back_to_download() {
        let tmp = tempfile::tempdir().unwrap();
        let (file_name, bytes, sidecar) = archive(tmp.path());
        let sidecar_name = format!("{file_name}.sha256");

        let mut server = Server::new_async().await;
        let base = server.url();
        let body = release_json(
            &base,
            &[(file_name.as_str(), bytes.len() as u64), (sidecar_name.as_str(), 65)],
        );
        let _listing = server
            .mock("GET", "/repos/acme/php-builds/releases/tags/v2")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let _archive = server
            .mock("GET", format!("/download/{file_name}").as_str())
            .with_status(200)
            .with_body(bytes)
            .create_async()
            .await;
        let _sidecar = server
            .mock("GET", format!("/download/{sidecar_name}").as_str())
            .with_status(502)
            .create_async()
            .await;

        let packages = collect_release(
            &Client::new(),
            &base,
            "acme/php-builds",
            "v2",
            &ReleaseOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].entry.sha256.as_str(), sidecar.trim());

        let shallow = ReleaseOptions {
            shallow: true,
            ..Default::default()
        };
        let packages = collect_release(&Client::new(), &base, "acme/php-builds", "v2", &shallow)
            .await
            .unwrap();
        assert!(packages.is_empty());
    }

    #[tokio::test]
    async fn test_missing_release_is_an_error() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/repos/acme/php-builds/releases/tags/nope")
            .with_status(404)
            .create_async()
            .await;

        let result = collect_release(
            &Client::new(),
            &server.url(),
            "acme/php-builds",
            "nope",
            &ReleaseOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(IndexError::Http(_))));
    }
}
