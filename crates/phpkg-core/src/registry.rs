//! Build-unit registry.
//!
//! The registry is filled once at startup from a declarative TOML catalog
//! (`[[unit]]` tables) and is read-only afterwards. Registration order is
//! significant: the resolver uses it to break ties, which keeps plans
//! deterministic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use phpkg_schema::{BuildUnit, UnitName};
use serde::Deserialize;
use thiserror::Error;

/// The catalog shipped inside the binaries.
pub const EMBEDDED_CATALOG: &str = include_str!("../catalog/units.toml");

/// Plan-time failures. All of them are raised before any external process
/// is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A unit with the same name is already registered.
    #[error("unit '{0}' is registered twice")]
    DuplicateUnit(UnitName),

    /// The name is not registered.
    #[error("unknown unit '{0}'")]
    UnknownUnit(UnitName),

    /// The name uses characters outside `[a-z0-9._+:-]`.
    #[error("invalid unit name '{0}'")]
    InvalidUnitName(String),

    /// The dependency graph has a cycle.
    #[error("dependency cycle detected: {}", format_cycle(.path))]
    CycleDetected {
        /// The cycle, with the first unit repeated at the end.
        path: Vec<UnitName>,
    },

    /// A `depends_on` edge points at an unregistered unit.
    #[error("unit '{unit}' depends on '{missing}', which is not registered")]
    MissingDependency {
        /// The unit declaring the edge.
        unit: UnitName,
        /// The edge target.
        missing: UnitName,
    },
}

fn format_cycle(path: &[UnitName]) -> String {
    path.iter()
        .map(UnitName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors that can occur when loading a catalog file.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The TOML content could not be deserialized into units.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The units parsed but do not form a valid registry.
    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "unit")]
    units: Vec<BuildUnit>,
}

/// Every known build unit, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    units: Vec<BuildUnit>,
    positions: HashMap<UnitName, usize>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog document and register every unit in file order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Parse`] for malformed TOML and
    /// [`CatalogError::Plan`] for duplicate or invalid names.
    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(text)?;
        let mut registry = Self::new();
        for unit in file.units {
            registry.register(unit)?;
        }
        Ok(registry)
    }

    /// Load a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Io`] if the file cannot be read, otherwise
    /// as [`Registry::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// The embedded default catalog.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded catalog itself is broken.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_toml_str(EMBEDDED_CATALOG)
    }

    /// Add a unit.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DuplicateUnit`] if the name exists and
    /// [`PlanError::InvalidUnitName`] if it is malformed.
    pub fn register(&mut self, unit: BuildUnit) -> Result<(), PlanError> {
        if !unit.name.is_valid() {
            return Err(PlanError::InvalidUnitName(unit.name.to_string()));
        }
        if self.positions.contains_key(&unit.name) {
            return Err(PlanError::DuplicateUnit(unit.name));
        }
        self.positions.insert(unit.name.clone(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    /// Look up a unit.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownUnit`] if absent.
    pub fn get(&self, name: &str) -> Result<&BuildUnit, PlanError> {
        self.position(name)
            .map(|idx| &self.units[idx])
            .ok_or_else(|| PlanError::UnknownUnit(UnitName::new(name)))
    }

    /// Whether a unit is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Registration index of a unit.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions
            .get(name)
            .or_else(|| self.positions.get(UnitName::new(name).as_str()))
            .copied()
    }

    /// Every unit in registration order.
    pub fn all(&self) -> &[BuildUnit] {
        &self.units
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Check that every `depends_on` edge references a registered unit.
    ///
    /// # Errors
    ///
    /// Returns the first [`PlanError::MissingDependency`] in registration
    /// order.
    pub fn validate(&self) -> Result<(), PlanError> {
        for unit in &self.units {
            for dep in &unit.depends_on {
                if !self.positions.contains_key(dep) {
                    return Err(PlanError::MissingDependency {
                        unit: unit.name.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The given units plus everything they transitively depend on, in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownUnit`] for an unknown root and
    /// [`PlanError::MissingDependency`] for a dangling edge.
    pub fn depends_closure<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<UnitName>, PlanError> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();

        for root in roots {
            let idx = self
                .position(root.as_ref())
                .ok_or_else(|| PlanError::UnknownUnit(UnitName::new(root.as_ref())))?;
            if seen.insert(idx) {
                queue.push_back(idx);
            }
        }

        while let Some(idx) = queue.pop_front() {
            let unit = &self.units[idx];
            for dep in &unit.depends_on {
                let dep_idx =
                    self.positions
                        .get(dep)
                        .copied()
                        .ok_or_else(|| PlanError::MissingDependency {
                            unit: unit.name.clone(),
                            missing: dep.clone(),
                        })?;
                if seen.insert(dep_idx) {
                    queue.push_back(dep_idx);
                }
            }
        }

        Ok(seen
            .into_iter()
            .map(|idx| self.units[idx].name.clone())
            .collect())
    }

    /// Every unit that transitively depends on `name` (excluding `name`
    /// itself), in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownUnit`] if `name` is not registered.
    pub fn dependents_closure(&self, name: &str) -> Result<Vec<UnitName>, PlanError> {
        let root = self.get(name)?.name.clone();

        let mut reverse: HashMap<&UnitName, Vec<usize>> = HashMap::new();
        for (idx, unit) in self.units.iter().enumerate() {
            for dep in &unit.depends_on {
                reverse.entry(dep).or_default().push(idx);
            }
        }

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([&root]);
        while let Some(current) = queue.pop_front() {
            for &idx in reverse.get(current).into_iter().flatten() {
                if seen.insert(idx) {
                    queue.push_back(&self.units[idx].name);
                }
            }
        }

        Ok(seen
            .into_iter()
            .map(|idx| self.units[idx].name.clone())
            .filter(|n| *n != root)
            .collect())
    }
}
