//! The toolchain hook.
//!
//! The executor never compiles anything itself: it hands each unit's
//! opaque `build_command` to a [`Toolchain`]. [`ShellToolchain`] runs the
//! command under `/bin/sh` with a sanitised environment; tests substitute
//! recording fakes.
//!
//! On Unix each command runs in its own process group. Cancellation sends
//! `SIGTERM` to the whole group and `SIGKILL` once the grace period is
//! over, so compilers and downloads started by the shell stop with it.
//!
//! ## Environment contract
//!
//! Build commands receive exactly these variables, followed by the
//! configured `env` table (which may override any of them):
//!
//! | Variable | Value |
//! |---|---|
//! | `PATH` | `/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin` |
//! | `HOME` | The unit's work directory |
//! | `TERM` | `dumb` |
//! | `LANG` | `en_US.UTF-8` |
//! | `ARCH` | Target architecture (`aarch64` or `x86_64`) |
//! | `PLATFORM` | Target platform (`darwin-arm64`) |
//! | `PREFIX` | Runtime install prefix of packages (`/usr/local`) |
//! | `DESTDIR` | The unit's staging directory |
//! | `DEPS_PREFIX` | Install prefix of the static libraries |
//! | `JOBS` | Logical CPUs divided among the concurrent builds |
//! | `SOURCE_DATE_EPOCH` | `0` |
//! | `PHP_VERSION` | Configured PHP version |
//! | `UNIT_NAME` / `UNIT_VERSION` | The unit being built |
//! | `SOURCE_URL` | Upstream tarball, when the unit has one |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use phpkg_schema::BuildUnit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BuildConfig;

/// Fixed epoch for `SOURCE_DATE_EPOCH`, so embedded timestamps do not
/// depend on when the build ran.
const SOURCE_DATE_EPOCH: &str = "0";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Runtime prefix packages install under unless `env.PREFIX` overrides it.
pub const DEFAULT_PREFIX: &str = "/usr/local";

/// Everything a toolchain needs to build one unit.
#[derive(Debug, Clone)]
pub struct ToolchainStep {
    /// The unit being built.
    pub unit: BuildUnit,
    /// Shell text to execute.
    pub command: String,
    /// Working directory (created by the executor).
    pub work_dir: PathBuf,
    /// Complete environment of the command.
    pub env: BTreeMap<String, String>,
    /// Log file owned by this step; output is appended to it.
    pub log_path: PathBuf,
    /// Run-level cancellation.
    pub cancel: CancellationToken,
    /// How long an in-flight command may keep running after cancellation.
    pub grace_period: Duration,
}

/// Result of one toolchain invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainOutput {
    /// Process exit code; `None` if it was killed by a signal.
    pub exit_code: Option<i32>,
    /// Output not already written to the log (appended by the executor).
    pub output: String,
    /// The run was cancelled while the command was in flight.
    pub cancelled: bool,
}

impl ToolchainOutput {
    /// Exit code zero and not cancelled.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }
}

/// External build hook.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run one build command to completion.
    ///
    /// A non-zero exit code is reported through [`ToolchainOutput`];
    /// `Err` is reserved for failures to run the command at all.
    async fn run(&self, step: &ToolchainStep) -> std::io::Result<ToolchainOutput>;
}

#[async_trait]
impl<T: Toolchain + ?Sized> Toolchain for std::sync::Arc<T> {
    async fn run(&self, step: &ToolchainStep) -> std::io::Result<ToolchainOutput> {
        (**self).run(step).await
    }
}

/// Environment of a build command for `unit` under `config`.
pub fn build_env(config: &BuildConfig, unit: &BuildUnit) -> BTreeMap<String, String> {
    let paths = &config.paths;
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };

    set("PATH", DEFAULT_PATH.to_string());
    set("HOME", paths.unit_work_dir(&unit.name).display().to_string());
    set("TERM", "dumb".to_string());
    set("LANG", "en_US.UTF-8".to_string());
    set("ARCH", config.platform.arch().rust_name().to_string());
    set("PLATFORM", config.platform.to_string());
    set("PREFIX", DEFAULT_PREFIX.to_string());
    set(
        "DESTDIR",
        paths.unit_stage_dir(&unit.name).display().to_string(),
    );
    set("DEPS_PREFIX", paths.deps_prefix().display().to_string());
    set("JOBS", (num_cpus::get() / config.jobs.max(1)).max(1).to_string());
    set("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string());
    set("PHP_VERSION", config.php_version.to_string());
    set("UNIT_NAME", unit.name.to_string());
    set("UNIT_VERSION", unit.version.to_string());
    if let Some(url) = &unit.source_url {
        set("SOURCE_URL", url.clone());
    }

    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Runs build commands with `/bin/sh -c`, streaming stdout and stderr into
/// the unit log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellToolchain;

#[async_trait]
impl Toolchain for ShellToolchain {
    async fn run(&self, step: &ToolchainStep) -> std::io::Result<ToolchainOutput> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&step.log_path)?;

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&step.command)
            .current_dir(&step.work_dir)
            .env_clear()
            .envs(&step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        debug!(unit = %step.unit.name, work_dir = %step.work_dir.display(), "spawning build command");
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            () = step.cancel.cancelled() => None,
        };
        if let Some(status) = finished {
            return Ok(ToolchainOutput {
                exit_code: status.code(),
                output: String::new(),
                cancelled: false,
            });
        }

        debug!(unit = %step.unit.name, grace = ?step.grace_period, "cancelled, terminating build command");
        signal_group(pid, GroupSignal::Terminate);
        let exit_code = if let Ok(status) = tokio::time::timeout(step.grace_period, child.wait()).await {
            status?.code()
        } else {
            warn!(unit = %step.unit.name, "grace period elapsed, killing build command");
            signal_group(pid, GroupSignal::Kill);
            child.kill().await?;
            None
        };
        // Children that outlived the shell.
        signal_group(pid, GroupSignal::Kill);

        Ok(ToolchainOutput {
            exit_code,
            output: String::new(),
            cancelled: true,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal every process in the group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = raw, ?signal, error = %e, "could not signal build process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
