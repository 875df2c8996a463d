//! Plain-text progress output for build runs.

use std::time::Duration;

use phpkg_core::{Reporter, SkipReason};
use phpkg_schema::{UnitName, Version};

/// Writes one line per event; failures and warnings go to stderr.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        println!();
        println!("  {}", title.to_lowercase());
    }

    fn unit_started(&self, unit: &UnitName, version: &Version) {
        println!("    building {unit} {version}");
    }

    fn unit_skipped(&self, unit: &UnitName, version: &Version, reason: &SkipReason) {
        println!("    skipped {unit} {version} ({reason})");
    }

    fn unit_done(&self, unit: &UnitName, version: &Version, elapsed: Duration, archive: Option<&str>) {
        match archive {
            Some(archive) => println!(
                "    built {unit} {version} ({:.1}s) -> {archive}",
                elapsed.as_secs_f64()
            ),
            None => println!("    built {unit} {version} ({:.1}s)", elapsed.as_secs_f64()),
        }
    }

    fn unit_failed(&self, unit: &UnitName, version: &Version, reason: &str, log_tail: Option<&str>) {
        eprintln!("    failed {unit} {version}: {reason}");
        if let Some(tail) = log_tail {
            eprintln!();
            for line in tail.lines() {
                eprintln!("      | {line}");
            }
            eprintln!();
        }
    }

    fn info(&self, msg: &str) {
        println!("  {msg}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("  warning: {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("  error: {msg}");
    }

    fn summary(&self, built: usize, skipped: usize, failed: usize, elapsed: Duration) {
        println!();
        println!(
            "  {built} built, {skipped} skipped, {failed} failed in {:.1}s",
            elapsed.as_secs_f64()
        );
    }
}
