//! `phpkg-pkg` - phpkg packaging and index maintenance tool.
//!
//! Packages staged build output, generates the package index from a dist
//! directory or a published release, verifies archives and lints the
//! build catalog.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use phpkg_core::indexer::{self, ReleaseOptions};
use phpkg_core::markers::write_atomic;
use phpkg_core::packaging::{PackageStage, StagingDirSource, stage_extension_ini, verify_archive};
use phpkg_core::toolchain::DEFAULT_PREFIX;
use phpkg_core::{BuildConfig, MarkerStore, Paths, PlanError, Registry, resolve};
use phpkg_schema::version::is_newer;
use phpkg_schema::{IndexDocument, UnitKind};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Parser)]
#[command(name = "phpkg-pkg", author, version)]
#[command(about = "Package, index and verify phpkg builds", long_about = None)]
struct Cli {
    /// Config file (defaults to ./phpkg.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Build catalog replacing the embedded one
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Root of the work, stage, dist and state directories
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Debug logging (`RUST_LOG` takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package the staged output of one unit
    Package {
        /// Unit to package
        #[arg(short, long)]
        unit: String,
        /// Staging root holding one directory per unit (default: <home>/stage)
        #[arg(short, long)]
        stage: Option<PathBuf>,
        /// Output directory (default: <home>/dist)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Generate the package index
    Index {
        /// Directory of built archives
        #[arg(long, conflicts_with = "from_release", required_unless_present = "from_release")]
        from_dir: Option<PathBuf>,
        /// Release repository in owner/repo format
        #[arg(long, requires = "tag")]
        from_release: Option<String>,
        /// Release tag
        #[arg(long)]
        tag: Option<String>,
        /// Releases API base URL
        #[arg(long, default_value = DEFAULT_API_BASE)]
        api_base: String,
        /// Build entries from asset names and sidecars without downloading archives
        #[arg(long)]
        shallow: bool,
        /// Base download URL for archives found in --from-dir
        #[arg(long, default_value = "")]
        base_url: String,
        /// Output path for the index file
        #[arg(short, long, default_value = "index.json")]
        output: PathBuf,
    },
    /// Lint the build catalog
    Check,
    /// Verify archive checksums and manifests
    Verify {
        /// Archives to verify
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Show which units are built
    Status,
    /// List units whose catalog version is newer than the published one
    Outdated {
        /// Existing index (file path or URL)
        #[arg(long)]
        index: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = BuildConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(home) = &cli.home {
        config.paths = Paths::new(home);
    }
    let catalog = cli.catalog.clone().or_else(|| config.catalog.clone());
    let load_registry = || -> Result<Registry> {
        match &catalog {
            Some(path) => Registry::load(path)
                .with_context(|| format!("failed to load catalog {}", path.display())),
            None => Registry::embedded().context("embedded catalog is invalid"),
        }
    };

    match cli.command {
        Commands::Package { unit, stage, out } => {
            let registry = load_registry()?;
            cli_package(&registry, &config, &unit, stage, out)?;
        }
        Commands::Index {
            from_dir,
            from_release,
            tag,
            api_base,
            shallow,
            base_url,
            output,
        } => {
            let packages = if let Some(repo) = from_release {
                let tag = tag.context("--tag is required with --from-release")?;
                let client = build_client()?;
                let options = ReleaseOptions {
                    shallow,
                    token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
                    ..ReleaseOptions::default()
                };
                println!("  indexing {repo}@{tag}");
                indexer::collect_release(&client, &api_base, &repo, &tag, &options).await?
            } else {
                let dir = from_dir.context("--from-dir or --from-release is required")?;
                let base_url = if base_url.is_empty() {
                    config.base_url.clone().unwrap_or_default()
                } else {
                    base_url
                };
                println!("  indexing {}", dir.display());
                indexer::collect_local(&dir, &base_url)?
            };

            let found = packages.len();
            let doc = indexer::build_index(packages, &generated_at()?);
            let json = doc.to_json().context("failed to encode index")?;
            write_atomic(&output, &json)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "  wrote {} ({} packages from {found} archives)",
                output.display(),
                doc.len()
            );
        }
        Commands::Check => {
            let registry = load_registry()?;
            cli_check(&registry, &config)?;
        }
        Commands::Verify { archives } => {
            let mut failed = 0;
            for path in &archives {
                match verify_archive(path) {
                    Ok(verified) => {
                        let sidecar = if verified.sidecar_checked { "" } else { " (no sidecar)" };
                        println!("  ok {} {}{sidecar}", path.display(), verified.sha256);
                    }
                    Err(e) => {
                        eprintln!("  error: {}: {e}", path.display());
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} archives failed verification", archives.len());
            }
        }
        Commands::Status => {
            let registry = load_registry()?;
            cli_status(&registry, &config);
        }
        Commands::Outdated { index } => {
            let registry = load_registry()?;
            let doc = load_index(&index).await?;
            cli_outdated(&registry, &config, &doc);
        }
    }

    Ok(())
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(phpkg_core::USER_AGENT)
        .build()
        .context("failed to build HTTP client")
}

/// `generated` timestamp of the index: `SOURCE_DATE_EPOCH` when set, so
/// rebuilt indexes are byte-identical, otherwise the current time.
fn generated_at() -> Result<String> {
    let time = match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(raw) if !raw.trim().is_empty() => {
            let secs: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid SOURCE_DATE_EPOCH '{raw}'"))?;
            DateTime::<Utc>::from_timestamp(secs, 0)
                .with_context(|| format!("SOURCE_DATE_EPOCH out of range: {secs}"))?
        }
        _ => Utc::now(),
    };
    Ok(time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn cli_package(
    registry: &Registry,
    config: &BuildConfig,
    unit: &str,
    stage: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<()> {
    let unit = registry.get(unit)?;
    if !unit.publishes() {
        bail!("{} is not published (set publish = true in the catalog)", unit.name);
    }

    let source = StagingDirSource::new(stage.unwrap_or_else(|| config.paths.stage_dir()));
    let unit_dir = source.unit_dir(unit);
    debug!(unit = %unit.name, dir = %unit_dir.display(), "packaging staged files");
    if !unit_dir.is_dir() {
        bail!("nothing staged for {} at {}", unit.name, unit_dir.display());
    }
    if let Some(info) = &unit.extension {
        let prefix = config.env.get("PREFIX").map_or(DEFAULT_PREFIX, String::as_str);
        if let Some(ini) = stage_extension_ini(&unit_dir, prefix, info)? {
            println!("    generated {}", ini.display());
        }
    }

    let stage = PackageStage::new(
        Arc::new(source),
        out.unwrap_or_else(|| config.paths.dist_dir()),
        config.php_version.clone(),
        config.platform.clone(),
    );
    let archive = stage
        .package_unit(unit)
        .with_context(|| format!("failed to package {}", unit.name))?
        .context("unit produced no package")?;

    println!("  packaged {} {}", unit.name, unit.version);
    println!("    {}", archive.path.display());
    println!("    sha256 {}", archive.sha256);
    println!(
        "    {} files, {} bytes ({} installed)",
        archive.manifest.files.len(),
        archive.size,
        archive.manifest.installed_size
    );
    Ok(())
}

fn cli_check(registry: &Registry, config: &BuildConfig) -> Result<()> {
    println!("  validating catalog");
    let mut errors = 0;
    let mut warnings = 0;

    let provided: HashMap<String, &phpkg_schema::Version> = registry
        .all()
        .iter()
        .filter(|u| u.publishes())
        .map(|u| (u.package_name(&config.php_version).to_string(), &u.version))
        .collect();

    for unit in registry.all() {
        for dep in &unit.depends_on {
            if !registry.contains(dep.as_str()) {
                eprintln!("  error: {}: missing dependency '{dep}'", unit.name);
                errors += 1;
            }
        }
        if unit.kind == UnitKind::Extension && unit.extension.is_none() {
            eprintln!("  error: {}: extension without [unit.extension] metadata", unit.name);
            errors += 1;
        }
        if unit.meta && unit.build_command.is_some() {
            println!("  warn: {}: meta unit has a build command", unit.name);
            warnings += 1;
        }
        if !unit.publishes() {
            continue;
        }
        if let Err(e) = unit.validate_package_name(&config.php_version) {
            eprintln!("  error: {}: {e}", unit.name);
            errors += 1;
        }
        for dep in &unit.depends {
            let unmet = provided
                .get(dep.name.as_str())
                .filter(|version| !dep.satisfied_by(version));
            if let Some(version) = unmet {
                eprintln!("  error: {}: requires {dep}, catalog builds {version}", unit.name);
                errors += 1;
            }
        }
        if unit.description.trim().is_empty() {
            println!("  warn: {}: missing description", unit.name);
            warnings += 1;
        }
        if !unit.meta && unit.license_file.is_none() {
            println!("  warn: {}: missing license file pattern", unit.name);
            warnings += 1;
        }
    }

    // Cycles only make sense once every edge resolves.
    if errors == 0 {
        let all: Vec<&str> = registry.all().iter().map(|u| u.name.as_str()).collect();
        if let Err(e @ PlanError::CycleDetected { .. }) = resolve(registry, &all, &HashSet::new()) {
            eprintln!("  error: {e}");
            errors += 1;
        }
    }

    println!();
    println!("  {} units, {errors} errors, {warnings} warnings", registry.len());
    if errors > 0 {
        bail!("check failed with {errors} errors");
    }
    println!("  catalog ok");
    Ok(())
}

fn cli_status(registry: &Registry, config: &BuildConfig) {
    let markers = MarkerStore::new(config.paths.markers_dir());
    let mut table = Table::new();
    table.set_header(vec!["unit", "kind", "catalog", "built", "status"]);

    let mut built = 0;
    for unit in registry.all() {
        let marker = markers.get(&unit.name);
        let (marker_version, status) = match &marker {
            Some(m) if m.version == unit.version => {
                built += 1;
                (m.version.to_string(), "built")
            }
            Some(m) => (m.version.to_string(), "stale"),
            None => (String::from("-"), "pending"),
        };
        table.add_row(vec![
            unit.name.to_string(),
            unit.kind.to_string(),
            unit.version.to_string(),
            marker_version,
            status.to_string(),
        ]);
    }

    println!("{table}");
    println!("  {built} of {} units built", registry.len());
}

async fn load_index(source: &str) -> Result<IndexDocument> {
    debug!(source, "loading index");
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        build_client()?
            .get(source)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec()
    } else {
        std::fs::read(Path::new(source)).with_context(|| format!("failed to read {source}"))?
    };
    IndexDocument::from_json(&bytes).with_context(|| format!("invalid index {source}"))
}

fn cli_outdated(registry: &Registry, config: &BuildConfig, doc: &IndexDocument) {
    let platform = config.platform.to_string();
    let mut table = Table::new();
    table.set_header(vec!["unit", "package", "published", "catalog"]);

    let mut outdated = 0;
    let mut unpublished = 0;
    for unit in registry.all().iter().filter(|u| u.publishes()) {
        let package = unit.package_name(&config.php_version);
        let published = match doc.find(&platform, package.as_str()) {
            Some(entry) if is_newer(entry.version.as_str(), unit.version.as_str()) => {
                outdated += 1;
                entry.version.to_string()
            }
            Some(_) => continue,
            None => {
                unpublished += 1;
                String::from("-")
            }
        };
        table.add_row(vec![
            unit.name.to_string(),
            package.to_string(),
            published,
            unit.version.to_string(),
        ]);
    }

    if outdated + unpublished == 0 {
        println!("  all published units up to date for {platform}");
        return;
    }
    println!("{table}");
    println!("  {outdated} outdated, {unpublished} unpublished for {platform}");
}
