//! Static compliance audit of addon bundles.
//!
//! Runs before any addon code executes. The audit is a best-effort lint
//! over bundle contents, not a runtime sandbox: it looks for embedded
//! shared-contract symbols, nested libraries, and textual reach-ins to
//! other addons' internals.

pub mod unit;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::bundle::Bundle;
use super::metadata::AddonMetadata;
use super::namespace::SharedContract;
use unit::CompiledUnit;

/// Kind of audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A unit declares a symbol the host publishes.
    EmbedsSharedContract,
    /// The bundle carries a nested library archive.
    EmbedsNestedLibrary,
    /// A unit declares an unpublished symbol under the shared prefix.
    SelfDefinesSharedSymbol,
    /// More than one addon defines the same shared-contract symbol.
    DuplicateSharedDefinition,
    /// A constant names another addon's internals.
    ImplicitCrossAddonReference,
    /// A unit could not be parsed and was skipped.
    MalformedUnit,
    /// A constant names another addon's published namespace without a
    /// declared dependency on it.
    UndeclaredDependencyReference,
}

impl ViolationKind {
    /// Returns true for kinds that block loading.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::MalformedUnit | Self::UndeclaredDependencyReference)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EmbedsSharedContract => "embeds shared contract",
            Self::EmbedsNestedLibrary => "embeds nested library",
            Self::SelfDefinesSharedSymbol => "self-defines shared symbol",
            Self::DuplicateSharedDefinition => "duplicate shared definition",
            Self::ImplicitCrossAddonReference => "implicit cross-addon reference",
            Self::MalformedUnit => "malformed unit",
            Self::UndeclaredDependencyReference => "undeclared dependency reference",
        };
        f.write_str(text)
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Violation {
    /// Addon the finding belongs to.
    pub addon: String,
    /// What was found.
    pub kind: ViolationKind,
    /// Symbol, constant or entry name involved.
    pub subject: String,
    /// Extra context.
    pub detail: String,
}

impl Violation {
    fn new(addon: &str, kind: ViolationKind, subject: &str, detail: String) -> Self {
        Self {
            addon: addon.to_string(),
            kind,
            subject: subject.to_string(),
            detail,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} '{}'", self.addon, self.kind, self.subject)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// Shared-contract symbol to defining addons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditIndex {
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl AuditIndex {
    fn insert(&mut self, symbol: &str, addon: &str) {
        self.owners
            .entry(symbol.to_string())
            .or_default()
            .insert(addon.to_string());
    }

    /// Addons defining `symbol`.
    #[must_use]
    pub fn owners(&self, symbol: &str) -> Option<&BTreeSet<String>> {
        self.owners.get(symbol)
    }

    /// Symbols defined by more than one addon.
    pub fn duplicates(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.owners
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(symbol, owners)| (symbol.as_str(), owners))
    }
}

/// Result of one audit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Findings, sorted by addon, kind and subject.
    pub violations: Vec<Violation>,
    /// Ordinary symbols declared per addon.
    pub declared: BTreeMap<String, BTreeSet<String>>,
    /// Shared-contract definitions across all addons.
    pub index: AuditIndex,
}

impl AuditReport {
    /// Findings for one addon.
    pub fn for_addon<'a>(&'a self, addon: &'a str) -> impl Iterator<Item = &'a Violation> {
        self.violations.iter().filter(move |v| v.addon == addon)
    }

    /// Returns true if the addon has at least one fatal finding.
    #[must_use]
    pub fn has_fatal(&self, addon: &str) -> bool {
        self.for_addon(addon).any(|v| v.kind.is_fatal())
    }

    /// Addons with at least one fatal finding.
    #[must_use]
    pub fn fatal_addons(&self) -> BTreeSet<&str> {
        self.violations
            .iter()
            .filter(|v| v.kind.is_fatal())
            .map(|v| v.addon.as_str())
            .collect()
    }

    /// Ordinary symbols an addon's units declare.
    #[must_use]
    pub fn declared_symbols(&self, addon: &str) -> BTreeSet<String> {
        self.declared.get(addon).cloned().unwrap_or_default()
    }
}

/// Audits bundles against the shared contract.
#[derive(Debug, Clone)]
pub struct ComplianceAuditor {
    contract: Arc<SharedContract>,
}

impl ComplianceAuditor {
    /// Creates an auditor for `contract`.
    #[must_use]
    pub fn new(contract: Arc<SharedContract>) -> Self {
        Self { contract }
    }

    /// Audits every addon in one discovery pass.
    ///
    /// Malformed units are reported and skipped; this never fails.
    #[must_use]
    pub fn audit(&self, addons: &[(&AddonMetadata, &Bundle)]) -> AuditReport {
        let mut findings: BTreeSet<Violation> = BTreeSet::new();
        let mut declared: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut index = AuditIndex::default();

        for (meta, bundle) in addons {
            let own = declared.entry(meta.id.clone()).or_default();

            for nested in &bundle.nested_libraries {
                findings.insert(Violation::new(
                    &meta.id,
                    ViolationKind::EmbedsNestedLibrary,
                    nested,
                    String::new(),
                ));
            }

            for entry in &bundle.units {
                let unit = match CompiledUnit::parse(&entry.bytes) {
                    Ok(unit) => unit,
                    Err(e) => {
                        tracing::warn!(addon = %meta.id, unit = %entry.name, "Skipping malformed unit: {}", e);
                        findings.insert(Violation::new(
                            &meta.id,
                            ViolationKind::MalformedUnit,
                            &entry.name,
                            e.to_string(),
                        ));
                        continue;
                    }
                };

                let symbol = unit.declared_symbol();
                if self.contract.is_shared(symbol) {
                    let kind = if self.contract.is_published(symbol) {
                        ViolationKind::EmbedsSharedContract
                    } else {
                        ViolationKind::SelfDefinesSharedSymbol
                    };
                    findings.insert(Violation::new(&meta.id, kind, symbol, entry.name.clone()));
                    index.insert(symbol, &meta.id);
                } else {
                    own.insert(symbol.to_string());
                }

                for text in unit.string_constants().chain(unit.referenced_symbols()) {
                    if let Some(finding) = cross_reference(&self.contract, meta, text, addons) {
                        findings.insert(finding);
                    }
                }
            }
        }

        for (symbol, owners) in index.duplicates() {
            let all: Vec<&str> = owners.iter().map(String::as_str).collect();
            for owner in owners {
                findings.insert(Violation::new(
                    owner,
                    ViolationKind::DuplicateSharedDefinition,
                    symbol,
                    format!("defined by {}", all.join(", ")),
                ));
            }
        }

        let violations: Vec<Violation> = findings.into_iter().collect();
        tracing::debug!(
            addons = addons.len(),
            violations = violations.len(),
            "Compliance audit finished"
        );
        AuditReport {
            violations,
            declared,
            index,
        }
    }
}

/// Classifies a constant that names another addon's symbols.
///
/// The constant is attributed to the addon with the longest matching root
/// prefix; constants attributed to the scanning addon itself are ignored.
/// Shared-contract symbols belong to the host and are never attributed.
fn cross_reference(
    contract: &SharedContract,
    meta: &AddonMetadata,
    text: &str,
    addons: &[(&AddonMetadata, &Bundle)],
) -> Option<Violation> {
    if contract.is_shared(text) {
        return None;
    }

    let target = addons
        .iter()
        .map(|(other, _)| *other)
        .filter(|other| !other.root_prefix().is_empty() && text.starts_with(other.root_prefix()))
        .max_by_key(|other| other.root_prefix().len())?;

    if target.id == meta.id || target.root_prefix() == meta.root_prefix() {
        return None;
    }

    if text.starts_with(&target.api_namespace) {
        if meta.declares_dependency(&target.id) {
            return None;
        }
        return Some(Violation::new(
            &meta.id,
            ViolationKind::UndeclaredDependencyReference,
            text,
            format!("'{}' is not a declared dependency", target.id),
        ));
    }

    Some(Violation::new(
        &meta.id,
        ViolationKind::ImplicitCrossAddonReference,
        text,
        format!("internal to '{}'", target.id),
    ))
}
