//! Dependency resolution.
//!
//! Computes which addons are eligible to load and in what order:
//!
//! 1. drop addons whose contract level differs from the host's;
//! 2. prune, to a fixed point, addons with a missing, ineligible or
//!    under-versioned required dependency;
//! 3. order the survivors with a lexicographically tie-broken
//!    topological sort over required edges; leftovers are cycles;
//! 4. best-effort: move dependents after satisfied optional
//!    dependencies without breaking required edges, within `n²` attempts;
//! 5. warn about unusable optional dependencies.
//!
//! All maps are ordered, so identical input yields identical output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use super::metadata::AddonMetadata;
use crate::version::Version;

/// Why an addon was excluded from the load order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyFailure {
    /// Declared contract level differs from the host's.
    ContractLevelMismatch {
        /// Level the addon declares.
        declared: u32,
        /// Level the host provides.
        host: u32,
    },
    /// A required dependency is not present at all.
    Missing {
        /// Dependency id.
        dependency: String,
    },
    /// A required dependency is present but was itself excluded.
    Ineligible {
        /// Dependency id.
        dependency: String,
    },
    /// A required dependency is older than the declared minimum.
    UnderVersioned {
        /// Dependency id.
        dependency: String,
        /// Declared minimum.
        required: Version,
        /// Version present.
        actual: Version,
    },
    /// The addon is part of, or depends on, a required-dependency cycle.
    Cycle {
        /// Every addon left unordered.
        members: Vec<String>,
    },
    /// Excluded before resolution (duplicate id, audit violation).
    Blocked {
        /// Reason supplied by the caller.
        reason: String,
    },
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractLevelMismatch { declared, host } => write!(
                f,
                "declares contract level {} but the host provides {}",
                declared, host
            ),
            Self::Missing { dependency } => {
                write!(f, "missing required dependency '{}'", dependency)
            }
            Self::Ineligible { dependency } => {
                write!(f, "required dependency '{}' is ineligible", dependency)
            }
            Self::UnderVersioned {
                dependency,
                required,
                actual,
            } => write!(
                f,
                "required dependency '{}' is {} but >= {} is needed",
                dependency, actual, required
            ),
            Self::Cycle { members } => {
                write!(f, "required-dependency cycle among [{}]", members.join(", "))
            }
            Self::Blocked { reason } => write!(f, "{}", reason),
        }
    }
}

/// What is wrong with an optional dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WarningKind {
    /// The optional dependency is not present.
    OptionalMissing,
    /// The optional dependency is present but excluded.
    OptionalIneligible,
    /// The optional dependency is older than the declared minimum.
    OptionalUnderVersioned {
        /// Declared minimum.
        required: Version,
        /// Version present.
        actual: Version,
    },
    /// The dependent could not be ordered after the optional dependency.
    OrderNotStabilized,
}

/// A non-fatal resolution finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    /// Addon declaring the optional dependency.
    pub addon: String,
    /// The optional dependency.
    pub dependency: String,
    /// What is wrong with it.
    pub kind: WarningKind,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::OptionalMissing => write!(
                f,
                "{}: optional dependency '{}' is not installed",
                self.addon, self.dependency
            ),
            WarningKind::OptionalIneligible => write!(
                f,
                "{}: optional dependency '{}' is ineligible",
                self.addon, self.dependency
            ),
            WarningKind::OptionalUnderVersioned { required, actual } => write!(
                f,
                "{}: optional dependency '{}' is {} but >= {} is wanted",
                self.addon, self.dependency, actual, required
            ),
            WarningKind::OrderNotStabilized => write!(
                f,
                "{}: could not be ordered after optional dependency '{}'",
                self.addon, self.dependency
            ),
        }
    }
}

/// Output of a resolution run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Load order.
    pub order: Vec<String>,
    /// Excluded addons and why.
    pub failures: BTreeMap<String, DependencyFailure>,
    /// Non-fatal findings.
    pub warnings: Vec<ResolutionWarning>,
}

/// Resolves the dependency graph for one session.
#[derive(Debug, Clone)]
pub struct AddonDependencyResolver {
    host_level: u32,
    blocked: BTreeMap<String, String>,
}

impl AddonDependencyResolver {
    /// Creates a resolver for the host's contract level.
    #[must_use]
    pub fn new(host_level: u32) -> Self {
        Self {
            host_level,
            blocked: BTreeMap::new(),
        }
    }

    /// Marks an id as excluded before resolution.
    ///
    /// The id does not need to be part of the input; dependents of a
    /// blocked id see it as ineligible rather than missing.
    #[must_use]
    pub fn with_blocked(mut self, id: &str, reason: &str) -> Self {
        self.blocked.insert(id.to_string(), reason.to_string());
        self
    }

    /// Runs the resolution.
    #[must_use]
    pub fn resolve(&self, addons: &BTreeMap<String, AddonMetadata>) -> Resolution {
        let mut failures: BTreeMap<String, DependencyFailure> = BTreeMap::new();
        let mut eligible: BTreeSet<&str> = addons.keys().map(String::as_str).collect();

        for (id, reason) in &self.blocked {
            if eligible.remove(id.as_str()) {
                failures.insert(
                    id.clone(),
                    DependencyFailure::Blocked {
                        reason: reason.clone(),
                    },
                );
            }
        }

        // 1. Contract level.
        for (id, meta) in addons {
            if eligible.contains(id.as_str()) && meta.contract_level != self.host_level {
                eligible.remove(id.as_str());
                failures.insert(
                    id.clone(),
                    DependencyFailure::ContractLevelMismatch {
                        declared: meta.contract_level,
                        host: self.host_level,
                    },
                );
            }
        }

        // 2. Fixed-point pruning. Each productive pass removes at least one
        // addon, so the loop runs at most `addons.len() + 1` times.
        for _ in 0..=addons.len() {
            let mut dropped = Vec::new();
            for id in &eligible {
                let meta = &addons[*id];
                if let Some(reason) = self.required_problem(meta, &eligible, addons) {
                    dropped.push((*id, reason));
                }
            }
            if dropped.is_empty() {
                break;
            }
            for (id, reason) in dropped {
                tracing::debug!(addon = id, %reason, "Pruned during dependency resolution");
                eligible.remove(id);
                failures.insert(id.to_string(), reason);
            }
        }

        // 3. Deterministic topological sort over required edges.
        let mut order = topological_order(&eligible, addons);
        let ordered: BTreeSet<String> = order.iter().cloned().collect();
        let unordered: Vec<String> = eligible
            .iter()
            .filter(|id| !ordered.contains(**id))
            .map(|id| (*id).to_string())
            .collect();
        for id in &unordered {
            failures.insert(
                id.clone(),
                DependencyFailure::Cycle {
                    members: unordered.clone(),
                },
            );
        }

        // 5 before 4 so warnings about unusable optionals come first.
        let mut warnings = optional_warnings(&order, &ordered, addons);

        // 4. Optional-order stabilization (best effort).
        stabilize(&mut order, &ordered, addons);
        warnings.extend(unstabilized(&order, &ordered, addons));

        Resolution {
            order,
            failures,
            warnings,
        }
    }

    fn required_problem(
        &self,
        meta: &AddonMetadata,
        eligible: &BTreeSet<&str>,
        addons: &BTreeMap<String, AddonMetadata>,
    ) -> Option<DependencyFailure> {
        for (dep, min) in &meta.required {
            if !eligible.contains(dep.as_str()) {
                return Some(if addons.contains_key(dep) || self.blocked.contains_key(dep) {
                    DependencyFailure::Ineligible {
                        dependency: dep.clone(),
                    }
                } else {
                    DependencyFailure::Missing {
                        dependency: dep.clone(),
                    }
                });
            }
            if let Some(min) = min {
                let actual = &addons[dep].version;
                if !actual.satisfies_min(min) {
                    return Some(DependencyFailure::UnderVersioned {
                        dependency: dep.clone(),
                        required: min.clone(),
                        actual: actual.clone(),
                    });
                }
            }
        }
        None
    }
}

/// Kahn's algorithm with a sorted ready set.
fn topological_order(
    eligible: &BTreeSet<&str>,
    addons: &BTreeMap<String, AddonMetadata>,
) -> Vec<String> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for id in eligible {
        let required = &addons[*id].required;
        indegree.insert(*id, required.len());
        for dep in required.keys() {
            dependents.entry(dep.as_str()).or_default().insert(*id);
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(eligible.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for child in children {
                if let Some(degree) = indegree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }
    order
}

/// True if `dep` is ordered and meets the optional minimum.
fn optional_usable(
    dep: &str,
    min: Option<&Version>,
    ordered: &BTreeSet<String>,
    addons: &BTreeMap<String, AddonMetadata>,
) -> bool {
    ordered.contains(dep) && min.is_none_or(|min| addons[dep].version.satisfies_min(min))
}

fn optional_warnings(
    order: &[String],
    ordered: &BTreeSet<String>,
    addons: &BTreeMap<String, AddonMetadata>,
) -> Vec<ResolutionWarning> {
    let mut ids: Vec<&String> = order.iter().collect();
    ids.sort();

    let mut warnings = Vec::new();
    for id in ids {
        for (dep, min) in &addons[id].optional {
            let kind = if !addons.contains_key(dep) {
                Some(WarningKind::OptionalMissing)
            } else if !ordered.contains(dep.as_str()) {
                Some(WarningKind::OptionalIneligible)
            } else {
                min.as_ref().and_then(|min| {
                    let actual = &addons[dep].version;
                    (!actual.satisfies_min(min)).then(|| WarningKind::OptionalUnderVersioned {
                        required: min.clone(),
                        actual: actual.clone(),
                    })
                })
            };
            if let Some(kind) = kind {
                warnings.push(ResolutionWarning {
                    addon: id.clone(),
                    dependency: dep.clone(),
                    kind,
                });
            }
        }
    }
    warnings
}

fn position(order: &[String], id: &str) -> Option<usize> {
    order.iter().position(|x| x == id)
}

/// Moves dependents right after their usable optional dependencies.
///
/// A move is refused if any addon it would jump over requires the
/// dependent. Gives up after `n²` attempts and keeps the current order.
fn stabilize(
    order: &mut Vec<String>,
    ordered: &BTreeSet<String>,
    addons: &BTreeMap<String, AddonMetadata>,
) {
    let bound = order.len().saturating_mul(order.len()).max(1);
    let mut attempts = 0;

    'passes: loop {
        let mut moved = false;
        let snapshot = order.clone();
        for dependent in &snapshot {
            for (dep, min) in &addons[dependent].optional {
                if !optional_usable(dep, min.as_ref(), ordered, addons) {
                    continue;
                }
                let (Some(pd), Some(po)) = (position(order, dependent), position(order, dep))
                else {
                    continue;
                };
                if po <= pd {
                    continue;
                }
                if attempts >= bound {
                    tracing::warn!(
                        "Optional dependency ordering gave up after {} relocation attempts",
                        attempts
                    );
                    break 'passes;
                }
                attempts += 1;

                let blocked = order[pd + 1..=po]
                    .iter()
                    .any(|between| addons[between].required.contains_key(dependent));
                if blocked {
                    continue;
                }
                let item = order.remove(pd);
                order.insert(po, item);
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
}

fn unstabilized(
    order: &[String],
    ordered: &BTreeSet<String>,
    addons: &BTreeMap<String, AddonMetadata>,
) -> Vec<ResolutionWarning> {
    let mut warnings = Vec::new();
    for (pd, dependent) in order.iter().enumerate() {
        for (dep, min) in &addons[dependent].optional {
            if !optional_usable(dep, min.as_ref(), ordered, addons) {
                continue;
            }
            if position(order, dep).is_some_and(|po| po > pd) {
                warnings.push(ResolutionWarning {
                    addon: dependent.clone(),
                    dependency: dep.clone(),
                    kind: WarningKind::OrderNotStabilized,
                });
            }
        }
    }
    warnings
}
