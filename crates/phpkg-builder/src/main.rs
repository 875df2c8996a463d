//! `phpkg-builder` - static PHP build runner.
//!
//! Resolves the requested units of the build catalog into a dependency
//! ordered plan and runs it: every unit's build command is executed once
//! its dependencies are built, the staged output is packaged into `dist/`,
//! and a marker is written so later runs skip it.

mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phpkg_core::packaging::PackageStage;
use phpkg_core::{
    BuildConfig, BuildPlan, Executor, FailurePolicy, MarkerStore, Paths, Registry, Reporter,
    ShellToolchain, StepAction, resolve,
};
use phpkg_schema::UnitName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use console::ConsoleReporter;

#[derive(Parser, Debug)]
#[command(name = "phpkg-builder", author, version, about = "Build PHP, its static libraries and extensions in dependency order", long_about = None)]
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

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the build plan without running anything
    Plan {
        /// Units to build (default: every unit in the catalog)
        targets: Vec<String>,
    },
    /// Forget build markers of units and of every unit built against them
    Clean {
        /// Units to invalidate
        #[arg(required = true)]
        units: Vec<String>,
    },
    /// Build units and their dependencies
    Build {
        /// Units to build (default: every unit in the catalog)
        targets: Vec<String>,

        /// Maximum concurrent builds
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Keep building independent units after a failure (default when
        /// every target is an extension)
        #[arg(long, conflicts_with = "fail_fast")]
        continue_on_error: bool,

        /// Stop releasing units after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Exit non-zero when any unit failed, even with --continue-on-error
        #[arg(long)]
        strict: bool,

        /// Rebuild units even if they are marked as built
        #[arg(long)]
        force: bool,

        /// Do not package build output into dist/
        #[arg(long)]
        no_package: bool,

        /// Keep work directories of successful builds
        #[arg(long)]
        keep_work_dirs: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = BuildConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(home) = &cli.home {
        config.paths = Paths::new(home);
    }

    let catalog = cli.catalog.as_ref().or(config.catalog.as_ref());
    let registry = match catalog {
        Some(path) => Registry::load(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => Registry::embedded().context("embedded catalog is invalid")?,
    };
    registry.validate().context("catalog has dangling dependencies")?;
    debug!(units = registry.len(), home = %config.paths.home().display(), "catalog loaded");

    match cli.command {
        Commands::Plan { targets } => {
            let targets = targets_or_all(&registry, targets);
            let markers = MarkerStore::new(config.paths.markers_dir());
            let plan = resolve(&registry, &targets, &markers.built_set(&registry))?;
            print_plan(&plan);
            Ok(())
        }
        Commands::Clean { units } => clean(&registry, &config, &units),
        Commands::Build {
            targets,
            jobs,
            continue_on_error,
            fail_fast,
            strict,
            force,
            no_package,
            keep_work_dirs,
        } => {
            if let Some(jobs) = jobs {
                config.set_jobs(jobs)?;
            }
            if continue_on_error {
                config.failure_policy = Some(FailurePolicy::ContinueAndCollect);
            } else if fail_fast {
                config.failure_policy = Some(FailurePolicy::StopOnFirstFailure);
            }
            config.strict_exit |= strict;
            config.keep_work_dirs |= keep_work_dirs;

            let targets = targets_or_all(&registry, targets);
            let code = build(registry, config, &targets, force, !no_package).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

fn targets_or_all(registry: &Registry, targets: Vec<String>) -> Vec<String> {
    if targets.is_empty() {
        registry.all().iter().map(|u| u.name.to_string()).collect()
    } else {
        targets
    }
}

fn clean(registry: &Registry, config: &BuildConfig, units: &[String]) -> Result<()> {
    let markers = MarkerStore::new(config.paths.markers_dir());
    let mut affected: Vec<UnitName> = Vec::new();
    for name in units {
        affected.push(registry.get(name)?.name.clone());
        affected.extend(registry.dependents_closure(name)?);
    }
    affected.sort();
    affected.dedup();

    let mut cleared = 0;
    for unit in &affected {
        if markers.get(unit).is_some() {
            markers
                .clear(unit)
                .with_context(|| format!("failed to clear marker of {unit}"))?;
            println!("    cleared {unit}");
            cleared += 1;
        }
    }
    println!("  {cleared} markers cleared");
    Ok(())
}

fn print_plan(plan: &BuildPlan) {
    let to_build = plan.to_build().count();
    println!(
        "  plan: {} units, {to_build} to build, {} skipped",
        plan.len(),
        plan.len() - to_build
    );
    for (i, layer) in plan.layers().iter().enumerate() {
        let names: Vec<String> = layer
            .iter()
            .map(|step| match &step.action {
                StepAction::Build => format!("{} {}", step.unit, step.version),
                StepAction::Skip(reason) => format!("{} {} ({reason})", step.unit, step.version),
            })
            .collect();
        println!("    {i}: {}", names.join(", "));
    }
}

async fn build(
    registry: Registry,
    config: BuildConfig,
    targets: &[String],
    force: bool,
    package: bool,
) -> Result<i32> {
    config
        .paths
        .ensure()
        .with_context(|| format!("failed to create {}", config.paths.home().display()))?;

    let markers = MarkerStore::new(config.paths.markers_dir());
    if force {
        for unit in registry.depends_closure(targets)? {
            markers
                .clear(&unit)
                .with_context(|| format!("failed to clear marker of {unit}"))?;
        }
    }

    let plan = resolve(&registry, targets, &markers.built_set(&registry))?;
    print_plan(&plan);

    let reporter = Arc::new(ConsoleReporter);
    let strict = config.strict_exit;
    let report_path = config.paths.report_path();
    let stage = PackageStage::from_config(&config);

    let mut executor = Executor::new(Arc::new(registry), Arc::new(config), Arc::new(ShellToolchain))
        .with_reporter(reporter.clone());
    if package {
        executor = executor.with_packaging(stage);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for running builds to stop");
            on_signal.cancel();
        }
    });

    let report = executor.run(&plan, &cancel).await;

    for failure in report.failures() {
        if let Some(log) = &failure.log_path {
            reporter.error(&format!("{}: full log at {}", failure.unit, log.display()));
        }
    }
    reporter.info(&format!("report written to {}", report_path.display()));

    Ok(report.exit_code(strict))
}
