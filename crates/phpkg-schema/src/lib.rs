//! Shared data model for phpkg.
//!
//! Everything here is plain data plus validation: unit and package names,
//! versions and their ordering, platforms, digests, the archive filename
//! grammar, and the manifest and index documents. No I/O.

pub mod arch;
pub mod hash;
pub mod index;
pub mod manifest;
pub mod naming;
pub mod types;
pub mod unit;
pub mod version;

// Re-exports
pub use arch::*;
pub use hash::*;
pub use index::{INDEX_FORMAT_VERSION, IndexDocument, IndexEntry, PlatformPackages};
pub use manifest::{Dependency, ExtensionInfo, PackageManifest};
pub use naming::{ARCHIVE_EXTENSION, ArchiveName};
pub use types::*;
pub use unit::{BuildUnit, CoreVariant, UnitKind};

/// Magic bytes for ZSTD compression (Little Endian: 0xFD2FB528 -> 28 B5 2F FD)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Magic bytes for gzip compression.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Validation failures for names, platforms, digests and archive filenames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Architecture spelling that maps to no supported target.
    #[error("unknown architecture '{0}'")]
    UnknownArch(String),

    /// Platform string that is not `{os}-{arch}`.
    #[error("invalid platform '{0}', expected <os>-<arch>")]
    InvalidPlatform(String),

    /// Package name with characters outside `[a-z0-9._+-]`.
    #[error("invalid package name '{0}'")]
    InvalidPackageName(String),

    /// Version that cannot be encoded in an archive filename.
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The offending version string.
        version: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Digest that is not 64 hex characters.
    #[error("invalid sha256 digest '{0}'")]
    InvalidDigest(String),

    /// Dependency string that is neither `name` nor `name (>= version)`.
    #[error("invalid dependency '{0}', expected 'name' or 'name (>= version)'")]
    InvalidDependency(String),

    /// Filename matching neither the canonical nor the compat grammar.
    #[error("unrecognized archive filename '{0}'")]
    UnrecognizedFilename(String),
}
