//! Build-plan resolution.
//!
//! Takes the requested targets and the set of already-built units and
//! produces a [`BuildPlan`]: every unit of the targets' dependency closure
//! in a topological order, with already-built units kept at their position
//! but annotated as skipped.

use std::collections::{BTreeSet, HashMap, HashSet};

use phpkg_schema::{UnitName, Version};

use crate::record::SkipReason;
use crate::registry::{PlanError, Registry};

/// What the executor should do with a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Run the toolchain hook.
    Build,
    /// Leave the unit alone.
    Skip(SkipReason),
}

/// One unit in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// Unit name.
    pub unit: UnitName,
    /// Version that will be built.
    pub version: Version,
    /// Direct dependencies (all earlier in the plan).
    pub depends_on: Vec<UnitName>,
    /// Build or skip.
    pub action: StepAction,
    /// Named as a target rather than pulled in as a dependency.
    pub requested: bool,
}

impl PlanStep {
    /// Whether the step will spawn a build.
    pub fn is_build(&self) -> bool {
        self.action == StepAction::Build
    }
}

/// Topologically ordered steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPlan {
    steps: Vec<PlanStep>,
}

impl BuildPlan {
    /// Steps in execution order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Unit names in order.
    pub fn order(&self) -> Vec<&UnitName> {
        self.steps.iter().map(|s| &s.unit).collect()
    }

    /// Steps that will spawn a build.
    pub fn to_build(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.is_build())
    }

    /// Index of a unit in the plan.
    pub fn position(&self, unit: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.unit.as_str() == unit)
    }

    /// Group the plan into waves: every step in a wave depends only on
    /// steps of earlier waves. Within a wave, plan order is kept.
    pub fn layers(&self) -> Vec<Vec<&PlanStep>> {
        let mut depth: HashMap<&UnitName, usize> = HashMap::new();
        let mut layers: Vec<Vec<&PlanStep>> = Vec::new();

        for step in &self.steps {
            let level = step
                .depends_on
                .iter()
                .filter_map(|d| depth.get(d))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(&step.unit, level);

            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(step);
        }

        layers
    }
}

/// Resolve a plan for `targets`.
///
/// Ordering is Kahn's algorithm over the dependency closure; among units
/// that are ready at the same time the one registered earliest goes first,
/// so the same registry and targets always give the same plan.
///
/// # Errors
///
/// - [`PlanError::UnknownUnit`] if a target is not registered,
/// - [`PlanError::MissingDependency`] if an edge points at an unregistered
///   unit,
/// - [`PlanError::CycleDetected`] with the concrete cycle if the closure is
///   not acyclic.
pub fn resolve<S: AsRef<str>>(
    registry: &Registry,
    targets: &[S],
    already_built: &HashSet<UnitName>,
) -> Result<BuildPlan, PlanError> {
    let closure = registry.depends_closure(targets)?;
    let requested: HashSet<&str> = targets.iter().map(|t| t.as_ref()).collect();

    // Everything below works on registration positions.
    let nodes: BTreeSet<usize> = closure
        .iter()
        .filter_map(|name| registry.position(name))
        .collect();

    let mut deps: HashMap<usize, BTreeSet<usize>> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &node in &nodes {
        let unit = &registry.all()[node];
        let unit_deps: BTreeSet<usize> = unit
            .depends_on
            .iter()
            .filter_map(|d| registry.position(d))
            .collect();
        for &dep in &unit_deps {
            dependents.entry(dep).or_default().push(node);
        }
        deps.insert(node, unit_deps);
    }

    let mut in_degree: HashMap<usize, usize> =
        nodes.iter().map(|n| (*n, deps[n].len())).collect();
    let mut ready: BTreeSet<usize> = nodes
        .iter()
        .copied()
        .filter(|n| in_degree[n] == 0)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in dependents.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(&dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < nodes.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let remaining: BTreeSet<usize> =
            nodes.iter().copied().filter(|n| !placed.contains(n)).collect();
        let path = find_cycle(&remaining, &deps)
            .into_iter()
            .map(|idx| registry.all()[idx].name.clone())
            .collect();
        return Err(PlanError::CycleDetected { path });
    }

    let steps = order
        .into_iter()
        .map(|idx| {
            let unit = &registry.all()[idx];
            let action = if already_built.contains(&unit.name) {
                StepAction::Skip(SkipReason::AlreadyBuilt)
            } else {
                StepAction::Build
            };
            PlanStep {
                unit: unit.name.clone(),
                version: unit.version.clone(),
                depends_on: deps[&idx]
                    .iter()
                    .map(|d| registry.all()[*d].name.clone())
                    .collect(),
                action,
                requested: requested.contains(unit.name.as_str()),
            }
        })
        .collect();

    Ok(BuildPlan { steps })
}

/// Walk dependency edges inside `remaining` until a node repeats.
///
/// Every node left over by Kahn's algorithm still has an unresolved
/// dependency inside the leftover set, so the walk always closes a cycle.
/// Returns the cycle with its first node repeated at the end.
fn find_cycle(remaining: &BTreeSet<usize>, deps: &HashMap<usize, BTreeSet<usize>>) -> Vec<usize> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut walk = vec![start];
    let mut seen_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(next) = deps
            .get(&current)
            .and_then(|d| d.iter().find(|n| remaining.contains(n)))
            .copied()
        else {
            return walk;
        };

        if let Some(&at) = seen_at.get(&next) {
            let mut cycle = walk.split_off(at);
            cycle.push(next);
            return cycle;
        }

        seen_at.insert(next, walk.len());
        walk.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phpkg_schema::{BuildUnit, UnitKind};

    fn registry(units: &[(&str, &[&str])]) -> Registry {
        let mut r = Registry::new();
        for (name, deps) in units {
            r.register(BuildUnit::new(*name, UnitKind::Library, "1.0").with_deps(deps.iter().copied()))
                .unwrap();
        }
        r
    }

    fn names(plan: &BuildPlan) -> Vec<&str> {
        plan.steps().iter().map(|s| s.unit.as_str()).collect()
    }

    #[test]
    fn test_zlib_libpng_freetype_order() {
        let r = registry(&[
            ("freetype", &["zlib", "libpng"]),
            ("libpng", &["zlib"]),
            ("zlib", &[]),
        ]);
        let plan = resolve(&r, &["freetype"], &HashSet::new()).unwrap();
        assert_eq!(names(&plan), vec!["zlib", "libpng", "freetype"]);
        let requested: Vec<bool> = plan.steps().iter().map(|s| s.requested).collect();
        assert_eq!(requested, vec![false, false, true]);
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let r = registry(&[("b", &[]), ("a", &[]), ("c", &["a", "b"])]);
        let plan = resolve(&r, &["c"], &HashSet::new()).unwrap();
        assert_eq!(names(&plan), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_every_dependency_precedes_its_dependent() {
        let r = Registry::embedded().unwrap();
        let all: Vec<&str> = r.all().iter().map(|u| u.name.as_str()).collect();
        let plan = resolve(&r, &all, &HashSet::new()).unwrap();
        assert_eq!(plan.len(), r.len());
        for (idx, step) in plan.steps().iter().enumerate() {
            for dep in &step.depends_on {
                assert!(plan.position(dep).unwrap() < idx, "{dep} after {}", step.unit);
            }
        }
    }

    #[test]
    fn test_already_built_stays_in_place() {
        let r = registry(&[("zlib", &[]), ("libpng", &["zlib"])]);
        let built = HashSet::from([UnitName::new("zlib")]);
        let plan = resolve(&r, &["libpng"], &built).unwrap();
        assert_eq!(names(&plan), vec!["zlib", "libpng"]);
        assert_eq!(plan.steps()[0].action, StepAction::Skip(SkipReason::AlreadyBuilt));
        assert_eq!(plan.steps()[1].action, StepAction::Build);
        assert_eq!(plan.to_build().count(), 1);
    }

    #[test]
    fn test_two_node_cycle() {
        let r = registry(&[("a", &["b"]), ("b", &["a"])]);
        let err = resolve(&r, &["a"], &HashSet::new()).unwrap_err();
        assert_eq!(
            err,
            PlanError::CycleDetected {
                path: vec![UnitName::new("a"), UnitName::new("b"), UnitName::new("a")]
            }
        );
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let r = registry(&[
            ("zlib", &[]),
            ("x", &["zlib", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
            ("top", &["x"]),
        ]);
        let err = resolve(&r, &["top"], &HashSet::new()).unwrap_err();
        let PlanError::CycleDetected { path } = &err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        let inner: HashSet<&str> = path.iter().map(UnitName::as_str).collect();
        assert_eq!(inner, HashSet::from(["x", "y", "z"]));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let r = registry(&[("a", &["a"])]);
        let err = resolve(&r, &["a"], &HashSet::new()).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: a -> a");
    }

    #[test]
    fn test_unknown_target_and_missing_edge() {
        let r = registry(&[("libpng", &["zlib"])]);
        assert!(matches!(
            resolve(&r, &["icu"], &HashSet::new()),
            Err(PlanError::UnknownUnit(_))
        ));
        assert!(matches!(
            resolve(&r, &["libpng"], &HashSet::new()),
            Err(PlanError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_layers() {
        let r = registry(&[
            ("zlib", &[]),
            ("icu", &[]),
            ("libpng", &["zlib"]),
            ("freetype", &["zlib", "libpng"]),
        ]);
        let plan = resolve(&r, &["freetype", "icu"], &HashSet::new()).unwrap();
        let layers: Vec<Vec<&str>> = plan
            .layers()
            .iter()
            .map(|l| l.iter().map(|s| s.unit.as_str()).collect())
            .collect();
        assert_eq!(layers, vec![vec!["zlib", "icu"], vec!["libpng"], vec!["freetype"]]);
    }

    #[test]
    fn test_duplicate_edges_do_not_stall() {
        let r = registry(&[("zlib", &[]), ("libpng", &["zlib", "zlib"])]);
        let plan = resolve(&r, &["libpng"], &HashSet::new()).unwrap();
        assert_eq!(names(&plan), vec!["zlib", "libpng"]);
    }
}
