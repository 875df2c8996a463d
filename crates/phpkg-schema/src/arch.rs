//! Target platforms.
//!
//! Packages are published per `{os}-{arch}` pair (e.g. `darwin-arm64`).
//! Architecture spellings are normalized on the way in so that `x86_64`
//! and `amd64` name the same target, as do `aarch64` and `arm64`.
//!
//! # Example
//!
//! ```
//! use phpkg_schema::{Arch, Platform};
//!
//! let p: Platform = "Darwin-x86_64".parse().unwrap();
//! assert_eq!(p.to_string(), "darwin-amd64");
//! assert_eq!(p.arch(), Arch::Amd64);
//! ```

use serde::{Deserialize, Serialize};

use crate::NameError;

/// CPU architecture of a package.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// ARM64 (Apple Silicon, `aarch64` Linux)
    #[default]
    Arm64,
    /// `x86_64` / AMD64
    Amd64,
}

impl Arch {
    /// Architecture of the running host.
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Self::Arm64
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Self::Amd64
        }
    }

    /// Normalized spelling used in platform strings and filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arm64 => "arm64",
            Self::Amd64 => "amd64",
        }
    }

    /// Toolchain-convention name (`aarch64` / `x86_64`), exported to build
    /// commands as `$ARCH`.
    pub fn rust_name(&self) -> &'static str {
        match self {
            Self::Arm64 => "aarch64",
            Self::Amd64 => "x86_64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "amd64" | "x86_64" | "x86-64" | "x64" => Ok(Self::Amd64),
            _ => Err(NameError::UnknownArch(s.to_string())),
        }
    }
}

/// An `{os}-{arch}` target pair.
///
/// `os` is a lowercase ASCII alphanumeric word (`darwin`, `linux`); the
/// platform string never contains `_`, which the archive filename grammar
/// relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: Arch,
}

impl Platform {
    /// Build a platform from an OS word and an architecture.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::InvalidPlatform`] if `os` is empty or contains
    /// anything other than ASCII letters and digits.
    pub fn new(os: &str, arch: Arch) -> Result<Self, NameError> {
        let os = os.to_lowercase();
        if os.is_empty() || !os.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NameError::InvalidPlatform(format!("{os}-{arch}")));
        }
        Ok(Self { os, arch })
    }

    /// Platform of the running host (`macos` is reported as `darwin`).
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: Arch::current(),
        }
    }

    /// The operating system word.
    pub fn os(&self) -> &str {
        &self.os
    }

    /// The normalized architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl std::str::FromStr for Platform {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The arch half may itself contain '_' ("x86_64"), so split on the
        // first '-' only.
        let (os, arch) = s
            .split_once('-')
            .ok_or_else(|| NameError::InvalidPlatform(s.to_string()))?;
        let arch: Arch = arch
            .parse()
            .map_err(|_| NameError::InvalidPlatform(s.to_string()))?;
        Self::new(os, arch)
    }
}

impl TryFrom<String> for Platform {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.to_string()
    }
}
