//! Build configuration.
//!
//! One explicit [`BuildConfig`] value is threaded through the executor in
//! place of exported shell globals. Layers, lowest priority first:
//!
//! 1. built-in defaults,
//! 2. `phpkg.toml` (every key optional),
//! 3. `PHPKG_*` environment variables,
//! 4. command-line flags (applied by the binaries).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use phpkg_schema::{Platform, UnitKind, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{Paths, try_phpkg_home};
use crate::registry::Registry;
use crate::resolver::BuildPlan;

/// PHP version assumed when nothing else is configured.
pub const DEFAULT_PHP_VERSION: &str = "8.3";

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "phpkg.toml";

/// Errors raised while assembling a [`BuildConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`ConfigFile`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// A setting has an unusable value.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Setting name (`jobs`, `PHPKG_PLATFORM`, ...).
        key: String,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Neither `PHPKG_HOME` nor a home directory is available.
    #[error("could not determine the phpkg home directory; set PHPKG_HOME")]
    NoHome,
}

/// What the executor does after a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop releasing new units after the first failure.
    #[default]
    StopOnFirstFailure,
    /// Keep building every subtree that does not depend on a failure.
    ContinueAndCollect,
}

impl FailurePolicy {
    /// Policy for a plan when none was configured: an extension sweep
    /// (every requested unit is an extension) keeps going past failures,
    /// anything else stops at the first one.
    pub fn for_plan(plan: &BuildPlan, registry: &Registry) -> Self {
        let mut requested = plan.steps().iter().filter(|s| s.requested).peekable();
        if requested.peek().is_none() {
            return Self::StopOnFirstFailure;
        }
        let sweep = requested.all(|step| {
            registry
                .get(&step.unit)
                .is_ok_and(|u| u.kind == UnitKind::Extension)
        });
        if sweep {
            Self::ContinueAndCollect
        } else {
            Self::StopOnFirstFailure
        }
    }
}

/// On-disk shape of `phpkg.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// PHP version packages are built for.
    pub php_version: Option<String>,
    /// Target platform (`darwin-arm64`).
    pub platform: Option<String>,
    /// Root of the work/stage/dist/state tree.
    pub home: Option<PathBuf>,
    /// Maximum concurrent build units.
    pub jobs: Option<usize>,
    /// Failure handling.
    pub failure_policy: Option<FailurePolicy>,
    /// Log lines kept in a failure summary.
    pub tail_lines: Option<usize>,
    /// Extra attempts after a failed build.
    pub retries: Option<u32>,
    /// Seconds an in-flight build gets after cancellation.
    pub grace_period_secs: Option<u64>,
    /// Keep work directories of successful units.
    pub keep_work_dirs: Option<bool>,
    /// Non-zero exit when any unit fails under continue-and-collect.
    pub strict_exit: Option<bool>,
    /// Prefix of download URLs written to the index.
    pub base_url: Option<String>,
    /// Catalog file replacing the embedded one.
    pub catalog: Option<PathBuf>,
    /// Variables forwarded to every build command.
    pub env: BTreeMap<String, String>,
}

impl ConfigFile {
    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// PHP version packages are built for.
    pub php_version: Version,
    /// Target platform.
    pub platform: Platform,
    /// Directory layout.
    pub paths: Paths,
    /// Maximum concurrent build units (at least 1).
    pub jobs: usize,
    /// Failure handling; `None` lets [`FailurePolicy::for_plan`] decide.
    pub failure_policy: Option<FailurePolicy>,
    /// Log lines kept in a failure summary.
    pub tail_lines: usize,
    /// Extra attempts after a failed build.
    pub retries: u32,
    /// Time an in-flight build gets after cancellation before it is killed.
    pub grace_period: Duration,
    /// Keep work directories of successful units.
    pub keep_work_dirs: bool,
    /// Non-zero exit when any unit fails under continue-and-collect.
    pub strict_exit: bool,
    /// Prefix of download URLs written to the index.
    pub base_url: Option<String>,
    /// Catalog file replacing the embedded one.
    pub catalog: Option<PathBuf>,
    /// Variables forwarded to every build command (`CFLAGS`,
    /// `DEPS_PREFIX`, `MACOSX_DEPLOYMENT_TARGET`, ...).
    pub env: BTreeMap<String, String>,
}

impl BuildConfig {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            php_version: Version::new(DEFAULT_PHP_VERSION),
            platform: Platform::current(),
            paths: Paths::new(home),
            jobs: num_cpus::get().max(1),
            failure_policy: None,
            tail_lines: 50,
            retries: 0,
            grace_period: Duration::from_secs(10),
            keep_work_dirs: false,
            strict_exit: false,
            base_url: None,
            catalog: None,
            env: BTreeMap::new(),
        }
    }

    /// Load defaults, then `config_path` (or `./phpkg.toml` if present),
    /// then the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is unreadable or a value is
    /// invalid.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => ConfigFile::load(path)?,
            None => {
                let local = Path::new(CONFIG_FILE_NAME);
                if local.is_file() {
                    ConfigFile::load(local)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with environment lookups.
    ///
    /// `lookup` is consulted for `PHPKG_HOME`, `PHPKG_JOBS`,
    /// `PHPKG_PHP_VERSION`, `PHPKG_PLATFORM` and `PHPKG_BASE_URL`; the
    /// environment wins over the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unusable values and
    /// [`ConfigError::NoHome`] if no home directory can be determined.
    pub fn resolve(
        file: ConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let home = env("PHPKG_HOME")
            .map(PathBuf::from)
            .or(file.home)
            .or_else(try_phpkg_home)
            .ok_or(ConfigError::NoHome)?;

        let mut config = Self::with_home(home);

        if let Some(v) = env("PHPKG_PHP_VERSION").or(file.php_version) {
            config.php_version = Version::new(&v);
        }
        if let Some(raw) = env("PHPKG_PLATFORM") {
            config.platform = parse_platform("PHPKG_PLATFORM", &raw)?;
        } else if let Some(raw) = file.platform {
            config.platform = parse_platform("platform", &raw)?;
        }
        if let Some(raw) = env("PHPKG_JOBS") {
            let jobs = raw.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key: "PHPKG_JOBS".to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            config.set_jobs(jobs)?;
        } else if let Some(jobs) = file.jobs {
            config.set_jobs(jobs)?;
        }
        if let Some(url) = env("PHPKG_BASE_URL").or(file.base_url) {
            config.base_url = Some(url);
        }

        config.failure_policy = file.failure_policy;
        if let Some(n) = file.tail_lines {
            config.tail_lines = n;
        }
        if let Some(n) = file.retries {
            config.retries = n;
        }
        if let Some(secs) = file.grace_period_secs {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(keep) = file.keep_work_dirs {
            config.keep_work_dirs = keep;
        }
        if let Some(strict) = file.strict_exit {
            config.strict_exit = strict;
        }
        config.catalog = file.catalog;
        config.env = file.env;

        Ok(config)
    }

    /// Set the worker count.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for zero.
    pub fn set_jobs(&mut self, jobs: usize) -> Result<(), ConfigError> {
        if jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "jobs".to_string(),
                value: "0".to_string(),
                reason: "at least one job is required".to_string(),
            });
        }
        self.jobs = jobs;
        Ok(())
    }
}

fn parse_platform(key: &str, value: &str) -> Result<Platform, ConfigError> {
    value.parse().map_err(|e: phpkg_schema::NameError| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
