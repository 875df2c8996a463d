//! Build executor.
//!
//! [`Executor::execute`] drives one unit through the toolchain hook, the
//! packaging stage and the marker store. [`Executor::run`] schedules a whole
//! [`BuildPlan`] on a bounded worker pool: a unit is released only once
//! every dependency has succeeded (or was already built), so a unit never
//! runs concurrently with one of its ancestors.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use phpkg_schema::{BuildUnit, UnitName};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BuildConfig, FailurePolicy};
use crate::markers::{MarkerStore, write_atomic};
use crate::packaging::{
    PackageError, PackageStage, PackagedArchive, stage_extension_ini, stage_license,
};
use crate::record::{BuildRecord, BuildStatus, SkipReason};
use crate::registry::Registry;
use crate::reporter::{NullReporter, Reporter};
use crate::resolver::{BuildPlan, StepAction};
use crate::toolchain::{DEFAULT_PREFIX, Toolchain, ToolchainStep, build_env};

/// Exit code of a run that was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Why a unit failed.
#[derive(Error, Debug)]
pub enum ExecuteError {
    /// The build command exited non-zero or was killed.
    #[error("build command for {unit} failed ({})", describe_exit(.code))]
    ToolchainFailure {
        /// Failed unit.
        unit: UnitName,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
    },

    /// The run was cancelled while the unit was building.
    #[error("build of {unit} was cancelled")]
    Cancelled {
        /// Interrupted unit.
        unit: UnitName,
    },

    /// The unit is not in the registry.
    #[error("unit {0} is not registered")]
    UnknownUnit(UnitName),

    /// Directory, log or marker I/O failed.
    #[error("IO error while building {unit}: {source}")]
    Io {
        /// Affected unit.
        unit: UnitName,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The packaging stage failed.
    #[error("packaging {unit} failed: {source}")]
    Package {
        /// Affected unit.
        unit: UnitName,
        /// Underlying error.
        #[source]
        source: PackageError,
    },
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(
        || "killed by signal".to_string(),
        |c| format!("exit code {c}"),
    )
}

/// Summary of one [`Executor::run`], persisted to `state/build-report.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// One record per plan step, in plan order.
    pub records: Vec<BuildRecord>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Failure policy in effect.
    pub failure_policy: FailurePolicy,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// Units that built successfully in this run.
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, BuildStatus::Success))
    }

    /// Units that failed.
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, BuildStatus::Failed))
    }

    /// Units that never ran, for any reason.
    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, BuildStatus::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&BuildStatus) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.status)).count()
    }

    /// Record of one unit.
    pub fn record(&self, unit: &str) -> Option<&BuildRecord> {
        self.records.iter().find(|r| r.unit.as_str() == unit)
    }

    /// Failed records, in plan order.
    pub fn failures(&self) -> impl Iterator<Item = &BuildRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, BuildStatus::Failed))
    }

    /// Process exit status for this run.
    ///
    /// A failure is fatal under stop-on-first-failure, and under
    /// continue-and-collect only when `strict` is set. A cancelled run
    /// always exits with [`EXIT_CANCELLED`].
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.cancelled {
            return EXIT_CANCELLED;
        }
        let fatal = self.failed() > 0
            && (strict || self.failure_policy == FailurePolicy::StopOnFirstFailure);
        i32::from(fatal)
    }

    /// Write the report as pretty JSON through an atomic rename.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        json.push(b'\n');
        write_atomic(path, &json)
    }

    /// Read a report written by [`RunReport::save`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file is missing or malformed.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }
}

/// Runs units through the toolchain, packaging and marker store.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<Registry>,
    config: Arc<BuildConfig>,
    toolchain: Arc<dyn Toolchain>,
    markers: MarkerStore,
    packager: Option<Arc<PackageStage>>,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("units", &self.registry.len())
            .field("jobs", &self.config.jobs)
            .field("markers", &self.markers)
            .field("packager", &self.packager)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor with markers under the configured state directory, no
    /// packaging stage and a silent reporter.
    pub fn new(
        registry: Arc<Registry>,
        config: Arc<BuildConfig>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        let markers = MarkerStore::new(config.paths.markers_dir());
        Self {
            registry,
            config,
            toolchain,
            markers,
            packager: None,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Package every published unit after a successful build.
    #[must_use]
    pub fn with_packaging(mut self, stage: PackageStage) -> Self {
        self.packager = Some(Arc::new(stage));
        self
    }

    /// Report progress through `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The marker store used to skip built units.
    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Build one unit.
    ///
    /// A unit whose marker matches its version is skipped without invoking
    /// the toolchain. Failures are captured in the returned record: the
    /// status is `Failed`, `error_summary` holds the tail of the log and
    /// the work directory is left in place.
    pub async fn execute(&self, name: &UnitName, cancel: &CancellationToken) -> BuildRecord {
        let Ok(unit) = self.registry.get(name) else {
            let mut record = BuildRecord::pending(name.clone(), "0".into());
            apply(&mut record, BuildStatus::Running);
            record.error_summary = Some(ExecuteError::UnknownUnit(name.clone()).to_string());
            apply(&mut record, BuildStatus::Failed);
            return record;
        };

        let mut record = BuildRecord::pending(unit.name.clone(), unit.version.clone());

        if self.markers.is_built(&unit.name, &unit.version) {
            debug!(unit = %unit.name, version = %unit.version, "marker present, skipping");
            self.skip(&mut record, SkipReason::AlreadyBuilt);
            return record;
        }
        if cancel.is_cancelled() {
            self.skip(&mut record, SkipReason::Cancelled);
            return record;
        }

        let log_path = self.config.paths.build_log_path(&unit.name, &unit.version);
        record.log_path = Some(log_path.clone());
        apply(&mut record, BuildStatus::Running);
        self.reporter.unit_started(&unit.name, &unit.version);
        info!(unit = %unit.name, version = %unit.version, "building");

        let clock = Instant::now();
        match self.build(unit, &log_path, &mut record.attempts, cancel).await {
            Ok(archive) => {
                apply(&mut record, BuildStatus::Success);
                let archive_name = archive
                    .as_ref()
                    .and_then(|a| a.path.file_name())
                    .map(|n| n.to_string_lossy().into_owned());
                info!(unit = %unit.name, elapsed = ?clock.elapsed(), "build succeeded");
                self.reporter.unit_done(
                    &unit.name,
                    &unit.version,
                    clock.elapsed(),
                    archive_name.as_deref(),
                );
            }
            Err(err) => {
                let tail = read_last_lines(&log_path, self.config.tail_lines)
                    .ok()
                    .filter(|t| !t.trim().is_empty());
                error!(unit = %unit.name, error = %err, log = %log_path.display(), "build failed");
                record.error_summary = Some(tail.clone().unwrap_or_else(|| err.to_string()));
                apply(&mut record, BuildStatus::Failed);
                self.reporter.unit_failed(
                    &unit.name,
                    &unit.version,
                    &err.to_string(),
                    tail.as_deref(),
                );
            }
        }
        record
    }

    fn skip(&self, record: &mut BuildRecord, reason: SkipReason) {
        self.reporter
            .unit_skipped(&record.unit, &record.version, &reason);
        apply(record, BuildStatus::Skipped(reason));
    }

    async fn build(
        &self,
        unit: &BuildUnit,
        log_path: &Path,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<Option<PackagedArchive>, ExecuteError> {
        let paths = &self.config.paths;
        let io = |source| ExecuteError::Io {
            unit: unit.name.clone(),
            source,
        };

        let work_dir = paths.unit_work_dir(&unit.name);
        let stage_dir = paths.unit_stage_dir(&unit.name);
        recreate_dir(&work_dir).map_err(io)?;
        recreate_dir(&stage_dir).map_err(io)?;
        std::fs::create_dir_all(paths.log_dir()).map_err(io)?;
        std::fs::File::create(log_path).map_err(io)?;

        if let Some(command) = &unit.build_command {
            let step = ToolchainStep {
                unit: unit.clone(),
                command: command.clone(),
                work_dir: work_dir.clone(),
                env: build_env(&self.config, unit),
                log_path: log_path.to_path_buf(),
                cancel: cancel.clone(),
                grace_period: self.config.grace_period,
            };
            self.run_toolchain(&step, attempts).await?;
        } else {
            append_log(log_path, "no build command; nothing to run\n").map_err(io)?;
        }

        let prefix = self
            .config
            .env
            .get("PREFIX")
            .map_or(DEFAULT_PREFIX, String::as_str);
        if let (Some(info), false) = (&unit.extension, unit.meta) {
            stage_extension_ini(&stage_dir, prefix, info).map_err(io)?;
        }
        if let (Some(pattern), true, false) = (&unit.license_file, unit.publishes(), unit.meta) {
            let package = unit.package_name(&self.config.php_version);
            let staged = stage_license(&work_dir, &stage_dir, prefix, package.as_str(), pattern)
                .map_err(|source| ExecuteError::Package {
                    unit: unit.name.clone(),
                    source,
                })?;
            if staged.is_empty() {
                warn!(unit = %unit.name, pattern = %pattern, "no license file matched");
            }
        }

        let archive = match &self.packager {
            Some(stage) => {
                let stage = Arc::clone(stage);
                let owned = unit.clone();
                tokio::task::spawn_blocking(move || stage.package_unit(&owned))
                    .await
                    .map_err(|e| io(std::io::Error::other(e)))?
                    .map_err(|source| ExecuteError::Package {
                        unit: unit.name.clone(),
                        source,
                    })?
            }
            None => None,
        };

        self.markers
            .mark_built(&unit.name, &unit.version)
            .map_err(io)?;

        if !self.config.keep_work_dirs {
            if let Err(e) = std::fs::remove_dir_all(&work_dir) {
                warn!(unit = %unit.name, error = %e, "could not remove work directory");
            }
        }
        Ok(archive)
    }

    async fn run_toolchain(&self, step: &ToolchainStep, attempts: &mut u32) -> Result<(), ExecuteError> {
        let unit = &step.unit.name;
        let io = |source| ExecuteError::Io {
            unit: unit.clone(),
            source,
        };

        loop {
            *attempts += 1;
            append_log(&step.log_path, &format!("=== attempt {} ===\n", *attempts)).map_err(io)?;

            let output = self.toolchain.run(step).await.map_err(io)?;
            if !output.output.is_empty() {
                append_log(&step.log_path, &output.output).map_err(io)?;
            }

            if output.cancelled {
                return Err(ExecuteError::Cancelled { unit: unit.clone() });
            }
            if output.success() {
                return Ok(());
            }
            if *attempts > self.config.retries || step.cancel.is_cancelled() {
                return Err(ExecuteError::ToolchainFailure {
                    unit: unit.clone(),
                    code: output.exit_code,
                });
            }
            warn!(unit = %unit, attempt = *attempts, code = ?output.exit_code, "build command failed, retrying");
        }
    }

    /// Execute a plan.
    ///
    /// At most `jobs` units build at a time. Without a configured failure
    /// policy, [`FailurePolicy::for_plan`] picks one. When a unit fails,
    /// every pending unit that depends on it is marked `Skipped(Blocked)`;
    /// under [`FailurePolicy::StopOnFirstFailure`] nothing new is released and
    /// the remaining units end up `Skipped(Aborted)`. Cancelling `cancel`
    /// stops releasing units and signals in-flight builds; units that never
    /// started end up `Skipped(Cancelled)`.
    ///
    /// The report is also saved to `state/build-report.json`.
    pub async fn run(&self, plan: &BuildPlan, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let jobs = self.config.jobs.max(1);
        let policy = self
            .config
            .failure_policy
            .unwrap_or_else(|| FailurePolicy::for_plan(plan, &self.registry));
        debug!(?policy, jobs, "starting run");
        self.reporter.section("Building");

        let mut state = Schedule::new(plan);

        for (idx, step) in plan.steps().iter().enumerate() {
            if let StepAction::Skip(reason) = &step.action {
                self.skip(&mut state.records[idx], reason.clone());
            }
        }
        for (idx, step) in plan.steps().iter().enumerate() {
            if !step.is_build() {
                state.settle(idx, self.reporter.as_ref(), false);
            }
        }
        state.seed_ready();

        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut halted = false;

        loop {
            if !halted && !cancel.is_cancelled() {
                while tasks.len() < jobs {
                    let Some(idx) = state.ready.pop_first() else {
                        break;
                    };
                    let executor = self.clone();
                    let unit = plan.steps()[idx].unit.clone();
                    let token = cancel.clone();
                    let handle =
                        tasks.spawn(async move { executor.execute(&unit, &token).await });
                    in_flight.insert(handle.id(), idx);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let idx = match joined {
                Ok((id, record)) => {
                    let Some(idx) = in_flight.remove(&id) else {
                        continue;
                    };
                    state.records[idx] = record;
                    idx
                }
                Err(e) => {
                    let Some(idx) = in_flight.remove(&e.id()) else {
                        continue;
                    };
                    let reason = if e.is_panic() {
                        "build task panicked"
                    } else {
                        "build task was cancelled"
                    };
                    let record = &mut state.records[idx];
                    error!(unit = %record.unit, error = %e, "{reason}");
                    if matches!(record.status, BuildStatus::Pending) {
                        apply(record, BuildStatus::Running);
                    }
                    record.error_summary = Some(reason.to_string());
                    apply(record, BuildStatus::Failed);
                    self.reporter
                        .unit_failed(&record.unit, &record.version, reason, None);
                    idx
                }
            };

            let failed = matches!(state.records[idx].status, BuildStatus::Failed);
            if failed && policy == FailurePolicy::StopOnFirstFailure {
                halted = true;
            }
            state.settle(idx, self.reporter.as_ref(), cancel.is_cancelled());
        }

        let cancelled = cancel.is_cancelled();
        let leftover = if cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::Aborted
        };
        for record in &mut state.records {
            if matches!(record.status, BuildStatus::Pending) {
                self.skip(record, leftover.clone());
            }
        }

        let report = RunReport {
            records: state.records,
            started_at,
            finished_at: Utc::now(),
            failure_policy: policy,
            cancelled,
        };

        self.reporter.summary(
            report.succeeded(),
            report.skipped(),
            report.failed(),
            clock.elapsed(),
        );
        if let Err(e) = report.save(&self.config.paths.report_path()) {
            warn!(error = %e, "could not write build report");
        }
        report
    }
}

/// Scheduling state of a run, indexed by plan position.
struct Schedule {
    records: Vec<BuildRecord>,
    /// Dependencies that have not yet satisfied each step.
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}

impl Schedule {
    fn new(plan: &BuildPlan) -> Self {
        let steps = plan.steps();
        let index: HashMap<&UnitName, usize> = steps
            .iter()
            .enumerate()
            .map(|(idx, s)| (&s.unit, idx))
            .collect();

        let mut waiting_on = vec![0; steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (idx, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&dep_idx) = index.get(dep) {
                    waiting_on[idx] += 1;
                    dependents[dep_idx].push(idx);
                }
            }
        }

        Self {
            records: steps
                .iter()
                .map(|s| BuildRecord::pending(s.unit.clone(), s.version.clone()))
                .collect(),
            waiting_on,
            dependents,
            ready: BTreeSet::new(),
        }
    }

    fn seed_ready(&mut self) {
        let ready = self
            .records
            .iter()
            .zip(&self.waiting_on)
            .enumerate()
            .filter(|(_, (record, waiting))| **waiting == 0 && matches!(record.status, BuildStatus::Pending))
            .map(|(idx, _)| idx);
        self.ready.extend(ready);
    }

    /// Propagate the terminal status of `idx` to its dependents.
    fn settle(&mut self, idx: usize, reporter: &dyn Reporter, cancelled: bool) {
        if self.records[idx].status.satisfies_dependents() {
            for dependent in self.dependents[idx].clone() {
                self.waiting_on[dependent] -= 1;
                if self.waiting_on[dependent] == 0
                    && matches!(self.records[dependent].status, BuildStatus::Pending)
                {
                    self.ready.insert(dependent);
                }
            }
        } else if !cancelled {
            self.block_dependents(idx, reporter);
        }
    }

    fn block_dependents(&mut self, idx: usize, reporter: &dyn Reporter) {
        let by = match &self.records[idx].status {
            BuildStatus::Skipped(SkipReason::Blocked { by }) => by.clone(),
            _ => self.records[idx].unit.clone(),
        };

        let mut queue: VecDeque<usize> = self.dependents[idx].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            let record = &mut self.records[next];
            if !matches!(record.status, BuildStatus::Pending) {
                continue;
            }
            let reason = SkipReason::Blocked { by: by.clone() };
            reporter.unit_skipped(&record.unit, &record.version, &reason);
            apply(record, BuildStatus::Skipped(reason));
            self.ready.remove(&next);
            queue.extend(self.dependents[next].iter().copied());
        }
    }
}

fn apply(record: &mut BuildRecord, status: BuildStatus) {
    if let Err(e) = record.transition(status) {
        warn!(error = %e, "ignoring invalid status change");
    }
}

fn recreate_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

fn append_log(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())
}

/// Read the last `n` lines of a log file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn read_last_lines(path: &Path, n: usize) -> std::io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};

    // First window read from the end; doubled until it holds `n` lines.
    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = std::fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut window = TAIL_SIZE;

    loop {
        let seek_pos = file_len.saturating_sub(window);
        file.seek(SeekFrom::Start(seek_pos))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let buffer = String::from_utf8_lossy(&bytes);

        // If we seeked mid-file, drop the first (partial) line
        let content = if seek_pos > 0 {
            buffer.split_once('\n').map_or("", |(_, rest)| rest)
        } else {
            &buffer
        };

        let lines: Vec<&str> = content.lines().collect();
        if lines.len() >= n || seek_pos == 0 {
            let start = lines.len().saturating_sub(n);
            return Ok(lines[start..].join("\n"));
        }
        window = window.saturating_mul(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use crate::toolchain::ToolchainOutput;
    use async_trait::async_trait;
    use phpkg_schema::UnitKind;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every invocation; fails units listed in `fail`.
    #[derive(Default)]
    struct FakeToolchain {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
        fail_first: HashSet<String>,
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn run(&self, step: &ToolchainStep) -> std::io::Result<ToolchainOutput> {
            let name = step.unit.name.to_string();
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(name.clone());
                calls.iter().filter(|c| **c == name).count()
            };
            let fails = self.fail.contains(&name) || (attempt == 1 && self.fail_first.contains(&name));
            Ok(ToolchainOutput {
                exit_code: Some(if fails { 2 } else { 0 }),
                output: format!("building {name}\n"),
                cancelled: false,
            })
        }
    }

    impl FakeToolchain {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn registry(units: &[(&str, &[&str])]) -> Arc<Registry> {
        let mut r = Registry::new();
        for (name, deps) in units {
            r.register(
                BuildUnit::new(*name, UnitKind::Library, "1.0")
                    .with_deps(deps.iter().copied())
                    .with_command("make"),
            )
            .unwrap();
        }
        Arc::new(r)
    }

    fn setup(
        dir: &Path,
        units: &[(&str, &[&str])],
        toolchain: FakeToolchain,
        policy: FailurePolicy,
    ) -> (Executor, Arc<FakeToolchain>, Arc<Registry>) {
        let mut config = BuildConfig::with_home(dir);
        config.jobs = 2;
        config.failure_policy = Some(policy);
        let registry = registry(units);
        let toolchain = Arc::new(toolchain);
        let exec = Executor::new(Arc::clone(&registry), Arc::new(config), toolchain.clone());
        (exec, toolchain, registry)
    }

    fn status<'a>(report: &'a RunReport, unit: &str) -> &'a BuildStatus {
        &report.record(unit).unwrap().status
    }

    #[tokio::test]
    async fn test_execute_success_writes_marker_and_log() {
        let tmp = tempfile::tempdir().unwrap();
        let (exec, tc, _) = setup(tmp.path(), &[("zlib", &[])], FakeToolchain::default(), FailurePolicy::default());

        let record = exec.execute(&"zlib".into(), &CancellationToken::new()).await;
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(record.attempts, 1);
        assert!(exec.markers().is_built(&"zlib".into(), &"1.0".into()));

        let log = std::fs::read_to_string(record.log_path.unwrap()).unwrap();
        assert!(log.contains("=== attempt 1 ==="));
        assert!(log.contains("building zlib"));
        assert!(!tmp.path().join("work/zlib").exists());

        let again = exec.execute(&"zlib".into(), &CancellationToken::new()).await;
        assert_eq!(again.status, BuildStatus::Skipped(SkipReason::AlreadyBuilt));
        assert_eq!(tc.calls(), vec!["zlib"]);
    }

    #[tokio::test]
    async fn test_execute_failure_keeps_work_dir_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let tc = FakeToolchain {
            fail: HashSet::from(["zlib".to_string()]),
            ..Default::default()
        };
        let (exec, _, _) = setup(tmp.path(), &[("zlib", &[])], tc, FailurePolicy::default());

        let record = exec.execute(&"zlib".into(), &CancellationToken::new()).await;
        assert_eq!(record.status, BuildStatus::Failed);
        assert!(record.error_summary.unwrap().contains("building zlib"));
        assert!(tmp.path().join("work/zlib").is_dir());
        assert!(!exec.markers().is_built(&"zlib".into(), &"1.0".into()));
    }

    #[tokio::test]
    async fn test_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::with_home(tmp.path());
        config.retries = 1;
        let tc = Arc::new(FakeToolchain {
            fail_first: HashSet::from(["zlib".to_string()]),
            ..Default::default()
        });
        let exec = Executor::new(registry(&[("zlib", &[])]), Arc::new(config), tc.clone());

        let record = exec.execute(&"zlib".into(), &CancellationToken::new()).await;
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(record.attempts, 2);
        assert_eq!(tc.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unit_without_command_succeeds_without_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let mut r = Registry::new();
        r.register(BuildUnit::new("meta", UnitKind::Library, "1.0")).unwrap();
        let tc = Arc::new(FakeToolchain::default());
        let exec = Executor::new(
            Arc::new(r),
            Arc::new(BuildConfig::with_home(tmp.path())),
            tc.clone(),
        );

        let record = exec.execute(&"meta".into(), &CancellationToken::new()).await;
        assert_eq!(record.status, BuildStatus::Success);
        assert!(tc.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_blocks_dependents_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let tc = FakeToolchain {
            fail: HashSet::from(["zlib".to_string()]),
            ..Default::default()
        };
        let units: &[(&str, &[&str])] = &[
            ("zlib", &[]),
            ("icu", &[]),
            ("libpng", &["zlib"]),
            ("freetype", &["libpng"]),
        ];
        let (exec, tc, registry) = setup(tmp.path(), units, tc, FailurePolicy::ContinueAndCollect);
        let plan = resolve(&registry, &["freetype", "icu"], &HashSet::new()).unwrap();

        let report = exec.run(&plan, &CancellationToken::new()).await;
        assert_eq!(status(&report, "zlib"), &BuildStatus::Failed);
        assert_eq!(status(&report, "icu"), &BuildStatus::Success);
        let blocked = BuildStatus::Skipped(SkipReason::Blocked { by: "zlib".into() });
        assert_eq!(status(&report, "libpng"), &blocked);
        assert_eq!(status(&report, "freetype"), &blocked);
        assert!(!tc.calls().contains(&"libpng".to_string()));

        assert_eq!(report.exit_code(false), 0);
        assert_eq!(report.exit_code(true), 1);
        assert_eq!(RunReport::load(&tmp.path().join("state/build-report.json")).unwrap(), report);
    }

    #[tokio::test]
    async fn test_stop_on_first_failure_aborts_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let tc = FakeToolchain {
            fail: HashSet::from(["a".to_string()]),
            ..Default::default()
        };
        let units: &[(&str, &[&str])] = &[("a", &[]), ("b", &["a"]), ("c", &["x"]), ("x", &[])];
        let (exec, _, registry) = setup(tmp.path(), units, tc, FailurePolicy::StopOnFirstFailure);

        let mut config = (*exec.config).clone();
        config.jobs = 1;
        let exec = Executor::new(registry.clone(), Arc::new(config), exec.toolchain.clone());
        let plan = resolve(&registry, &["b", "c"], &HashSet::new()).unwrap();

        let report = exec.run(&plan, &CancellationToken::new()).await;
        assert_eq!(status(&report, "a"), &BuildStatus::Failed);
        assert_eq!(
            status(&report, "b"),
            &BuildStatus::Skipped(SkipReason::Blocked { by: "a".into() })
        );
        assert_eq!(status(&report, "x"), &BuildStatus::Skipped(SkipReason::Aborted));
        assert_eq!(status(&report, "c"), &BuildStatus::Skipped(SkipReason::Aborted));
        assert_eq!(report.exit_code(false), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (exec, tc, registry) = setup(
            tmp.path(),
            &[("zlib", &[]), ("libpng", &["zlib"])],
            FakeToolchain::default(),
            FailurePolicy::default(),
        );
        let plan = resolve(&registry, &["libpng"], &HashSet::new()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = exec.run(&plan, &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert_eq!(status(&report, "zlib"), &BuildStatus::Skipped(SkipReason::Cancelled));
        assert!(tc.calls().is_empty());
        assert_eq!(report.exit_code(false), EXIT_CANCELLED);
    }

    /// Panics while building `zlib`.
    struct PanickingToolchain;

    #[async_trait]
    impl Toolchain for PanickingToolchain {
        async fn run(&self, step: &ToolchainStep) -> std::io::Result<ToolchainOutput> {
            assert_ne!(step.unit.name.as_str(), "zlib", "toolchain crashed");
            Ok(ToolchainOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_panicking_task_fails_its_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::with_home(tmp.path());
        config.failure_policy = Some(FailurePolicy::ContinueAndCollect);
        let registry = registry(&[("zlib", &[]), ("icu", &[]), ("libpng", &["zlib"])]);
        let exec = Executor::new(registry.clone(), Arc::new(config), Arc::new(PanickingToolchain));
        let plan = resolve(&registry, &["libpng", "icu"], &HashSet::new()).unwrap();

        let report = exec.run(&plan, &CancellationToken::new()).await;
        let zlib = report.record("zlib").unwrap();
        assert_eq!(zlib.status, BuildStatus::Failed);
        assert_eq!(zlib.error_summary.as_deref(), Some("build task panicked"));
        assert_eq!(
            status(&report, "libpng"),
            &BuildStatus::Skipped(SkipReason::Blocked { by: "zlib".into() })
        );
        assert_eq!(status(&report, "icu"), &BuildStatus::Success);
    }

    #[tokio::test]
    async fn test_default_policy_follows_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let mut r = Registry::new();
        for name in ["ext:zip", "ext:redis"] {
            r.register(BuildUnit::new(name, UnitKind::Extension, "1.0").with_command("make"))
                .unwrap();
        }
        let registry = Arc::new(r);
        let tc = Arc::new(FakeToolchain {
            fail: HashSet::from(["ext:zip".to_string()]),
            ..Default::default()
        });
        let mut config = BuildConfig::with_home(tmp.path());
        config.jobs = 1;
        let exec = Executor::new(registry.clone(), Arc::new(config), tc.clone());
        let plan = resolve(&registry, &["ext:zip", "ext:redis"], &HashSet::new()).unwrap();

        let report = exec.run(&plan, &CancellationToken::new()).await;
        assert_eq!(report.failure_policy, FailurePolicy::ContinueAndCollect);
        assert_eq!(status(&report, "ext:zip"), &BuildStatus::Failed);
        assert_eq!(status(&report, "ext:redis"), &BuildStatus::Success);
        assert_eq!(report.exit_code(false), 0);
    }

    #[test]
    fn test_read_last_lines_beyond_first_window() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("build.log");
        let line = "x".repeat(99);
        let text: String = (0..1000).map(|i| format!("{i:04} {line}\n")).collect();
        std::fs::write(&path, text).unwrap();

        let tail = read_last_lines(&path, 500).unwrap();
        assert_eq!(tail.lines().count(), 500);
        assert!(tail.starts_with("0500 "));

        let all = read_last_lines(&path, 5000).unwrap();
        assert_eq!(all.lines().count(), 1000);
    }

    #[test]
    fn test_read_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("build.log");
        let text: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, text).unwrap();

        let tail = read_last_lines(&path, 3).unwrap();
        assert_eq!(tail, "line 4997\nline 4998\nline 4999");
    }
}
