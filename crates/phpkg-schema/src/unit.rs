//! Build-unit data model.
//!
//! A [`BuildUnit`] is one node of the build graph: a static library, a PHP
//! core variant or an extension, together with the metadata the packager
//! needs to turn its staged output into an archive. Units are declared once
//! in the catalog and never mutated.

use serde::{Deserialize, Serialize};

use crate::{Dependency, ExtensionInfo, NameError, PackageName, UnitName, Version};

/// Flavor of a PHP core package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreVariant {
    /// Command-line interpreter.
    Cli,
    /// `FastCGI` process manager.
    Fpm,
    /// CGI binary.
    Cgi,
    /// Shared configuration and directories.
    Common,
    /// Headers and `php-config` for building extensions.
    Dev,
    /// PEAR/PECL tooling.
    Pear,
}

impl CoreVariant {
    /// All variants, in packaging order.
    pub const ALL: [Self; 6] = [
        Self::Common,
        Self::Cli,
        Self::Fpm,
        Self::Cgi,
        Self::Dev,
        Self::Pear,
    ];

    /// Lowercase spelling used in unit and package names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Fpm => "fpm",
            Self::Cgi => "cgi",
            Self::Common => "common",
            Self::Dev => "dev",
            Self::Pear => "pear",
        }
    }
}

impl std::fmt::Display for CoreVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CoreVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown PHP core variant '{s}'"))
    }
}

/// What a unit produces.
///
/// Serialized as a single string: `library`, `extension`, or
/// `php-<variant>` (`php-cli`, `php-fpm`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UnitKind {
    /// Static library linked into PHP and extensions.
    Library,
    /// One variant of the PHP core build.
    PhpCore(CoreVariant),
    /// A PECL/PIE extension.
    Extension,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::PhpCore(variant) => write!(f, "php-{variant}"),
            Self::Extension => write!(f, "extension"),
        }
    }
}

impl TryFrom<String> for UnitKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "library" => Ok(Self::Library),
            "extension" => Ok(Self::Extension),
            other => other
                .strip_prefix("php-")
                .and_then(|v| v.parse().ok())
                .map(Self::PhpCore)
                .ok_or_else(|| {
                    format!("unknown unit kind '{other}', expected library, extension or php-<variant>")
                }),
        }
    }
}

impl From<UnitKind> for String {
    fn from(kind: UnitKind) -> Self {
        kind.to_string()
    }
}

/// One node of the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUnit {
    /// Unique unit name.
    pub name: UnitName,
    /// What the unit produces.
    pub kind: UnitKind,
    /// Upstream version being built.
    pub version: Version,
    /// Units that must be built first.
    #[serde(default)]
    pub depends_on: Vec<UnitName>,
    /// Upstream source tarball.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Opaque shell text handed to the toolchain hook. Units without one
    /// (meta-packages) succeed without spawning anything.
    #[serde(default)]
    pub build_command: Option<String>,
    /// Glob of the license file shipped in the package (`LICENSE*`).
    #[serde(default)]
    pub license_file: Option<String>,

    /// One-line package description.
    #[serde(default)]
    pub description: String,
    /// Override of the derived package name.
    #[serde(default)]
    pub package_name: Option<PackageName>,
    /// Package-level runtime dependencies.
    #[serde(default)]
    pub depends: Vec<Dependency>,
    /// Virtual names this package provides.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Packages that cannot be installed alongside this one.
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Meta-packages carry dependencies but no files.
    #[serde(default)]
    pub meta: bool,
    /// Whether the unit is packaged and indexed. Defaults to `false` for
    /// libraries (they are linked in statically) and `true` otherwise.
    #[serde(default)]
    pub publish: Option<bool>,
    /// Extension loading metadata.
    #[serde(default)]
    pub extension: Option<ExtensionInfo>,
}

impl BuildUnit {
    /// A bare unit with no dependencies, command or packaging metadata.
    pub fn new(name: impl Into<UnitName>, kind: UnitKind, version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            kind,
            version: version.into(),
            depends_on: Vec::new(),
            source_url: None,
            build_command: None,
            license_file: None,
            description: String::new(),
            package_name: None,
            depends: Vec::new(),
            provides: Vec::new(),
            conflicts: Vec::new(),
            meta: false,
            publish: None,
            extension: None,
        }
    }

    /// Builder-style helper to set `depends_on`.
    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitName>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style helper to set the build command.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = Some(command.into());
        self
    }

    /// Whether the unit produces a package.
    pub fn publishes(&self) -> bool {
        self.publish
            .unwrap_or(!matches!(self.kind, UnitKind::Library))
    }

    /// Name of the package this unit produces for a given PHP version.
    ///
    /// Libraries keep their unit name; core variants become
    /// `php{X.Y}-{variant}`; extensions become `php{X.Y}-{ext}`.
    pub fn package_name(&self, php_version: &Version) -> PackageName {
        if let Some(name) = &self.package_name {
            return name.clone();
        }

        let php = php_version.major_minor();
        match self.kind {
            UnitKind::Library => PackageName::new(self.name.as_str()),
            UnitKind::PhpCore(variant) => PackageName::new(&format!("php{php}-{variant}")),
            UnitKind::Extension => {
                let ext = self.extension.as_ref().map_or_else(
                    || {
                        let name = self.name.as_str();
                        name.strip_prefix("ext:").unwrap_or(name).to_string()
                    },
                    |info| info.name.clone(),
                );
                PackageName::new(&format!("php{php}-{ext}"))
            }
        }
    }

    /// Check the package name this unit would produce.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::InvalidPackageName`] if the derived name cannot
    /// appear in an archive filename.
    pub fn validate_package_name(&self, php_version: &Version) -> Result<PackageName, NameError> {
        let name = self.package_name(php_version);
        if name.is_valid() {
            Ok(name)
        } else {
            Err(NameError::InvalidPackageName(name.to_string()))
        }
    }
}
