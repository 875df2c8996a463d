//! Per-unit build records and their status machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use phpkg_schema::{UnitName, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a unit was not run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum SkipReason {
    /// A success marker for the same version exists.
    AlreadyBuilt,
    /// A dependency failed or was itself blocked.
    Blocked {
        /// The failed unit at the root of the chain.
        by: UnitName,
    },
    /// Not started because the run stopped on an earlier failure.
    Aborted,
    /// Not started because the run was cancelled.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyBuilt => write!(f, "already built"),
            Self::Blocked { by } => write!(f, "blocked by {by}"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of one unit within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum BuildStatus {
    /// Not started yet.
    Pending,
    /// The toolchain hook is running.
    Running,
    /// Built, packaged and marked.
    Success,
    /// The hook or the packaging stage failed.
    Failed,
    /// Never started.
    Skipped(SkipReason),
}

impl BuildStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped(_))
    }

    /// Whether dependents may be released: the unit succeeded, or it was
    /// already built by an earlier run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped(SkipReason::AlreadyBuilt))
    }

    /// Short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A status change the state machine does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition for {unit}: {from} -> {to}")]
pub struct TransitionError {
    /// Unit whose record was being updated.
    pub unit: UnitName,
    /// Current status label.
    pub from: String,
    /// Requested status label.
    pub to: String,
}

/// Outcome of one unit in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Unit name.
    pub unit: UnitName,
    /// Version being built.
    pub version: Version,
    /// Current status.
    pub status: BuildStatus,
    /// When the unit started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last log lines of a failed build, or the failure message.
    pub error_summary: Option<String>,
    /// Build log, if the unit ran.
    pub log_path: Option<PathBuf>,
    /// Number of toolchain invocations.
    pub attempts: u32,
}

impl BuildRecord {
    /// A fresh `Pending` record.
    pub fn pending(unit: UnitName, version: Version) -> Self {
        Self {
            unit,
            version,
            status: BuildStatus::Pending,
            started_at: None,
            finished_at: None,
            error_summary: None,
            log_path: None,
            attempts: 0,
        }
    }

    /// Apply a status change.
    ///
    /// Allowed: `Pending -> Running`, `Running -> Success | Failed` and
    /// `Pending -> Skipped`. Timestamps are filled in as a side effect.
    ///
    /// # Errors
    ///
    /// Returns a [`TransitionError`] for anything else; the record is left
    /// unchanged.
    pub fn transition(&mut self, next: BuildStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (&self.status, &next),
            (BuildStatus::Pending, BuildStatus::Running | BuildStatus::Skipped(_))
                | (BuildStatus::Running, BuildStatus::Success | BuildStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError {
                unit: self.unit.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            BuildStatus::Running => self.started_at = Some(now),
            _ => self.finished_at = Some(now),
        }
        self.status = next;
        Ok(())
    }
}
