//! Build graph, executor, packager and index aggregation for phpkg.
//!
//! A [`Registry`] of build units is resolved into a [`BuildPlan`], which an
//! [`Executor`] runs through a [`Toolchain`] on a bounded worker pool.
//! Successful units are packaged by [`packaging`] and published packages
//! are aggregated into an index by [`indexer`].

pub mod config;
pub mod executor;
pub mod indexer;
pub mod markers;
pub mod packaging;
pub mod paths;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod toolchain;

pub mod reporter;

pub use config::{BuildConfig, ConfigError, FailurePolicy};
pub use executor::{ExecuteError, Executor, RunReport};
pub use markers::MarkerStore;
pub use paths::*;
pub use record::{BuildRecord, BuildStatus, SkipReason};
pub use registry::{CatalogError, PlanError, Registry};
pub use reporter::{NullReporter, Reporter};
pub use resolver::{BuildPlan, PlanStep, StepAction, resolve};
pub use toolchain::{ShellToolchain, Toolchain, ToolchainOutput, ToolchainStep};

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("phpkg-core/", env!("CARGO_PKG_VERSION"));
