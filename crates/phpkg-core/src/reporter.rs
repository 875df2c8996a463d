//! Reporter trait for dependency injection
//!
//! The executor reports per-unit progress through this trait so that it is
//! not coupled to a particular console renderer.

use std::time::Duration;

use phpkg_schema::{UnitName, Version};

use crate::record::SkipReason;

pub trait Reporter: Send + Sync {
    /// A new phase has started (e.g. "Building").
    fn section(&self, title: &str);

    /// A unit's build command was started.
    fn unit_started(&self, unit: &UnitName, version: &Version);

    /// A unit was skipped.
    fn unit_skipped(&self, unit: &UnitName, version: &Version, reason: &SkipReason);

    /// A unit finished successfully; `archive` names the package it produced.
    fn unit_done(&self, unit: &UnitName, version: &Version, elapsed: Duration, archive: Option<&str>);

    /// A unit failed; `log_tail` holds the last lines of its build log.
    fn unit_failed(&self, unit: &UnitName, version: &Version, reason: &str, log_tail: Option<&str>);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Final one-line summary of a run.
    fn summary(&self, built: usize, skipped: usize, failed: usize, elapsed: Duration);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title)
    }
    fn unit_started(&self, unit: &UnitName, version: &Version) {
        (**self).unit_started(unit, version)
    }
    fn unit_skipped(&self, unit: &UnitName, version: &Version, reason: &SkipReason) {
        (**self).unit_skipped(unit, version, reason)
    }
    fn unit_done(&self, unit: &UnitName, version: &Version, elapsed: Duration, archive: Option<&str>) {
        (**self).unit_done(unit, version, elapsed, archive)
    }
    fn unit_failed(&self, unit: &UnitName, version: &Version, reason: &str, log_tail: Option<&str>) {
        (**self).unit_failed(unit, version, reason, log_tail)
    }
    fn info(&self, msg: &str) {
        (**self).info(msg)
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg)
    }
    fn error(&self, msg: &str) {
        (**self).error(msg)
    }
    fn summary(&self, built: usize, skipped: usize, failed: usize, elapsed: Duration) {
        (**self).summary(built, skipped, failed, elapsed)
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn unit_started(&self, _: &UnitName, _: &Version) {}
    fn unit_skipped(&self, _: &UnitName, _: &Version, _: &SkipReason) {}
    fn unit_done(&self, _: &UnitName, _: &Version, _: Duration, _: Option<&str>) {}
    fn unit_failed(&self, _: &UnitName, _: &Version, _: &str, _: Option<&str>) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn summary(&self, _: usize, _: usize, _: usize, _: Duration) {}
}
