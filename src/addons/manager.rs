//! Addon lifecycle orchestration.
//!
//! Drives every addon through discover → load → enable → disable on a
//! single thread. Faults raised by addon code are caught at a boundary
//! around every hook, recorded as [`AddonFault`] and contained to the
//! addon that raised them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::api::Addon;
use super::audit::{AuditReport, ComplianceAuditor};
use super::bundle::Bundle;
use super::context::AddonContext;
use super::error::{AddonFault, AddonPhase, HookError, SessionError, panic_message};
use super::metadata::AddonMetadata;
use super::namespace::{EntryPoints, IsolatedNamespace};
use super::resolver::{AddonDependencyResolver, Resolution};
use super::state::{AddonSession, AddonState};
use crate::version::Version;

/// A bundle file that was not considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBundle {
    /// Bundle file name.
    pub file: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of [`AddonManager::discover`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Ids with usable metadata.
    pub discovered: Vec<String>,
    /// Bundles skipped for unreadable archives or metadata.
    pub skipped: Vec<SkippedBundle>,
    /// Ids claimed by more than one bundle, with the bundle files.
    pub duplicates: BTreeMap<String, Vec<String>>,
    /// Compliance audit findings.
    pub audit: AuditReport,
    /// Dependency resolution.
    pub resolution: Resolution,
}

/// A discovered addon waiting for its load attempt.
struct DiscoveredAddon {
    metadata: Arc<AddonMetadata>,
    declared: BTreeSet<String>,
}

/// A successfully loaded addon.
struct LoadedAddon {
    namespace: IsolatedNamespace,
    context: Arc<AddonContext>,
}

/// The lifecycle orchestrator for one session.
pub struct AddonManager {
    session: Arc<AddonSession>,
    entry_points: Arc<EntryPoints>,
    addons_dir: PathBuf,
    enforce_audit: bool,
    pending: BTreeMap<String, DiscoveredAddon>,
    metadata: BTreeMap<String, Arc<AddonMetadata>>,
    order: Vec<String>,
    loaded: BTreeMap<String, LoadedAddon>,
    enable_order: Vec<String>,
    disable_order: Vec<String>,
    faults: Vec<AddonFault>,
}

impl std::fmt::Debug for AddonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonManager")
            .field("addons_dir", &self.addons_dir)
            .field("order", &self.order)
            .field("enable_order", &self.enable_order)
            .field("faults", &self.faults.len())
            .finish_non_exhaustive()
    }
}

impl AddonManager {
    /// Creates a manager over `addons_dir`.
    #[must_use]
    pub fn new(
        session: Arc<AddonSession>,
        entry_points: Arc<EntryPoints>,
        addons_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            entry_points,
            addons_dir: addons_dir.into(),
            enforce_audit: true,
            pending: BTreeMap::new(),
            metadata: BTreeMap::new(),
            order: Vec::new(),
            loaded: BTreeMap::new(),
            enable_order: Vec::new(),
            disable_order: Vec::new(),
            faults: Vec::new(),
        }
    }

    /// Whether fatal audit findings block loading. Defaults to `true`.
    #[must_use]
    pub fn with_audit_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_audit = enforce;
        self
    }

    /// The session this manager drives.
    #[must_use]
    pub fn session(&self) -> &Arc<AddonSession> {
        &self.session
    }

    /// State of `id`.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<AddonState> {
        self.session.states().get(id)
    }

    /// Resolved load order.
    #[must_use]
    pub fn load_order(&self) -> &[String] {
        &self.order
    }

    /// Addons enabled so far, in enable order.
    #[must_use]
    pub fn enable_order(&self) -> &[String] {
        &self.enable_order
    }

    /// Addons whose disable-hook ran, in the order it ran.
    #[must_use]
    pub fn disable_order(&self) -> &[String] {
        &self.disable_order
    }

    /// Every fault recorded this session.
    #[must_use]
    pub fn faults(&self) -> &[AddonFault] {
        &self.faults
    }

    /// Metadata of a discovered addon.
    #[must_use]
    pub fn metadata(&self, id: &str) -> Option<&AddonMetadata> {
        self.metadata.get(id).map(|m| &**m)
    }

    /// Discovers bundles, audits them and resolves the load order.
    ///
    /// Only session-level problems are returned as errors; everything
    /// addon-specific ends up in the report and in the state table.
    pub fn discover(&mut self) -> Result<DiscoveryReport, SessionError> {
        self.session.datadirs().ensure_root_directory()?;
        let paths = list_bundles(&self.addons_dir)?;

        let mut report = DiscoveryReport::default();
        let mut candidates: BTreeMap<String, Vec<(AddonMetadata, Bundle)>> = BTreeMap::new();

        for path in paths {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let contract_prefix = self.session.contract().prefix();
            let opened = Bundle::open(&path).map_err(|e| e.to_string()).and_then(|bundle| {
                AddonMetadata::from_descriptor(&bundle.descriptor)
                    .and_then(|meta| meta.check_outside_contract(contract_prefix).map(|()| meta))
                    .map(|meta| (meta, bundle))
                    .map_err(|e| e.to_string())
            });
            match opened {
                Ok((meta, bundle)) => {
                    candidates.entry(meta.id.clone()).or_default().push((meta, bundle));
                }
                Err(reason) => {
                    tracing::warn!("Skipping bundle {}: {}", file, reason);
                    report.skipped.push(SkippedBundle { file, reason });
                }
            }
        }

        let mut resolver = AddonDependencyResolver::new(self.session.contract_level());
        let mut unique: Vec<(AddonMetadata, Bundle)> = Vec::new();
        for (id, mut claims) in candidates {
            if claims.len() > 1 {
                let files: Vec<String> = claims.iter().map(|(_, b)| b.file_name.clone()).collect();
                let reason = format!("duplicate id in bundles {}", files.join(", "));
                self.session.states().insert(&id, AddonState::Failed);
                self.record(AddonFault::new(&id, AddonPhase::Load, true, reason.clone(), None));
                resolver = resolver.with_blocked(&id, &reason);
                report.duplicates.insert(id, files);
            } else if let Some(claim) = claims.pop() {
                self.session.states().insert(&id, AddonState::Discovered);
                report.discovered.push(id);
                unique.push(claim);
            }
        }

        let auditor = ComplianceAuditor::new(Arc::clone(self.session.contract()));
        let pairs: Vec<(&AddonMetadata, &Bundle)> = unique.iter().map(|(m, b)| (m, b)).collect();
        report.audit = auditor.audit(&pairs);

        for violation in &report.audit.violations {
            if violation.kind.is_fatal() {
                tracing::error!(addon = %violation.addon, kind = %violation.kind, "Compliance violation: {}", violation);
            } else {
                tracing::warn!(addon = %violation.addon, kind = %violation.kind, "Compliance advisory: {}", violation);
            }
        }
        for id in report.audit.fatal_addons() {
            if self.enforce_audit {
                resolver = resolver.with_blocked(id, "blocked by compliance violations");
            } else {
                tracing::warn!(addon = id, "Audit enforcement is off, loading despite violations");
            }
        }

        let by_id: BTreeMap<String, AddonMetadata> =
            unique.iter().map(|(m, _)| (m.id.clone(), m.clone())).collect();
        report.resolution = resolver.resolve(&by_id);

        for (id, failure) in &report.resolution.failures {
            self.fail_addon(id, AddonPhase::Load, &failure.to_string(), None, true);
        }
        for warning in &report.resolution.warnings {
            tracing::warn!(addon = %warning.addon, "Dependency warning: {}", warning);
        }

        for (meta, _) in unique {
            let meta = Arc::new(meta);
            self.metadata.insert(meta.id.clone(), Arc::clone(&meta));
            if report.resolution.order.contains(&meta.id) {
                let declared = report.audit.declared_symbols(&meta.id);
                self.pending.insert(
                    meta.id.clone(),
                    DiscoveredAddon {
                        metadata: meta,
                        declared,
                    },
                );
            }
        }
        self.order = report.resolution.order.clone();

        tracing::info!(
            discovered = report.discovered.len(),
            eligible = self.order.len(),
            skipped = report.skipped.len(),
            "Addon discovery finished"
        );
        Ok(report)
    }

    /// Loads every discovered addon in resolved order.
    pub fn load_all(&mut self) {
        for id in self.order.clone() {
            self.load(&id);
        }
    }

    /// Loads one discovered addon. Returns true if it reached LOADED.
    pub fn load(&mut self, id: &str) -> bool {
        if self.state(id) != Some(AddonState::Discovered) {
            return false;
        }
        let Some(discovered) = self.pending.remove(id) else {
            return false;
        };
        let meta = discovered.metadata;

        for dep in meta.required.keys() {
            if !matches!(self.state(dep), Some(AddonState::Loaded | AddonState::Enabled)) {
                let message = format!("required dependency '{}' is not loaded", dep);
                self.fail_addon(id, AddonPhase::Load, &message, None, true);
                return false;
            }
        }

        let namespace = IsolatedNamespace::new(
            id,
            discovered.declared,
            Arc::clone(self.session.contract()),
            Arc::clone(&self.entry_points),
        );
        if let Err(e) = namespace.instantiate(&meta.entry) {
            self.fail_addon(id, AddonPhase::Load, "cannot instantiate entry point", Some(e.to_string()), true);
            return false;
        }

        if let Err(reason) = verify_identity(&namespace, &meta) {
            namespace.close();
            self.fail_addon(id, AddonPhase::Load, "identity mismatch", Some(reason), true);
            return false;
        }

        let data_dir = match self.session.datadirs().ensure_addon_data_folder(id) {
            Ok(dir) => dir,
            Err(e) => {
                namespace.close();
                self.fail_addon(id, AddonPhase::Load, "data directory rejected", Some(e.to_string()), true);
                return false;
            }
        };

        let context = Arc::new(AddonContext::new(
            Arc::clone(&meta),
            Arc::clone(&self.session),
            data_dir,
        ));
        context.set_phase(AddonPhase::Load);

        let result = run_hook(&namespace, |addon| addon.on_load(&context));
        self.loaded.insert(
            id.to_string(),
            LoadedAddon {
                namespace,
                context,
            },
        );
        if let Err(cause) = result {
            self.fail_addon(id, AddonPhase::Load, "load hook failed", Some(cause), true);
            return false;
        }

        self.session.states().transition(id, AddonState::Loaded);
        tracing::info!(addon = id, version = %meta.version, "Addon loaded");
        true
    }

    /// Enables every loaded addon in resolved order.
    pub fn enable_all(&mut self) {
        for id in self.order.clone() {
            self.enable(&id);
        }
    }

    /// Enables one loaded addon. Returns true if it reached ENABLED.
    pub fn enable(&mut self, id: &str) -> bool {
        if self.state(id) != Some(AddonState::Loaded) {
            return false;
        }
        let Some(meta) = self.metadata.get(id).cloned() else {
            return false;
        };

        for dep in meta.required.keys() {
            if self.state(dep) != Some(AddonState::Enabled) {
                let message = format!("required dependency '{}' is not enabled", dep);
                self.fail_addon(id, AddonPhase::Enable, &message, None, true);
                return false;
            }
        }

        let result = match self.loaded.get(id) {
            Some(loaded) => {
                loaded.context.set_phase(AddonPhase::Enable);
                run_hook(&loaded.namespace, |addon| addon.on_enable(&loaded.context))
            }
            None => Err("no loaded instance".to_string()),
        };
        if let Err(cause) = result {
            self.fail_addon(id, AddonPhase::Enable, "enable hook failed", Some(cause), true);
            return false;
        }

        self.session.states().transition(id, AddonState::Enabled);

        if let Err(cause) = self.materialize_exposures(id) {
            self.fail_addon(id, AddonPhase::Enable, "capability exposure failed", Some(cause), true);
            return false;
        }

        if let Some(loaded) = self.loaded.get(id) {
            loaded.context.set_phase(AddonPhase::Runtime);
        }
        self.enable_order.push(id.to_string());
        tracing::info!(addon = id, "Addon enabled");
        true
    }

    /// Disables every enabled addon in reverse enable order, then closes
    /// anything that was loaded but never enabled.
    pub fn disable_all(&mut self) {
        for id in self.enable_order.iter().rev().cloned().collect::<Vec<_>>() {
            let Some(loaded) = self.loaded.remove(&id) else {
                continue;
            };
            loaded.context.set_phase(AddonPhase::Disable);
            self.release_host_resources(&id, &loaded.context);

            if let Err(cause) = run_hook(&loaded.namespace, |addon| addon.on_disable(&loaded.context)) {
                self.fail_addon(&id, AddonPhase::Disable, "disable hook failed", Some(cause), false);
            }
            self.disable_order.push(id.clone());
            self.session.states().transition(&id, AddonState::Disabled);
            loaded.namespace.close();
            tracing::info!(addon = %id, "Addon disabled");
        }

        let leftovers: Vec<String> = self.loaded.keys().cloned().collect();
        for id in leftovers {
            if let Some(loaded) = self.loaded.remove(&id) {
                self.release_host_resources(&id, &loaded.context);
                self.session.states().transition(&id, AddonState::Disabled);
                loaded.namespace.close();
                tracing::debug!(addon = %id, "Closed addon that was never enabled");
            }
        }

        self.pending.clear();
        self.session.registry().clear();
    }

    /// Central failure sink.
    ///
    /// Marks the addon FAILED when `fatal` or when `phase` is load or
    /// enable. A fatal fault on a loaded or enabled addon tears it down
    /// synchronously so no exposure outlives its provider.
    pub fn fail_addon(
        &mut self,
        id: &str,
        phase: AddonPhase,
        message: &str,
        cause: Option<String>,
        fatal: bool,
    ) {
        self.record(AddonFault::new(id, phase, fatal, message, cause));

        let mark_failed = fatal || matches!(phase, AddonPhase::Load | AddonPhase::Enable);
        if !mark_failed {
            return;
        }
        let previous = self.state(id);
        if previous.is_some_and(|s| !s.is_terminal()) {
            self.session.states().transition(id, AddonState::Failed);
        }
        self.pending.remove(id);
        if self.loaded.contains_key(id) {
            self.emergency_disable(id);
        }
    }

    /// Reports a fault raised by addon code after enable.
    pub fn report_runtime_fault(&mut self, id: &str, message: &str, cause: Option<String>, fatal: bool) {
        self.fail_addon(id, AddonPhase::Runtime, message, cause, fatal);
    }

    fn record(&mut self, fault: AddonFault) {
        if fault.fatal {
            tracing::error!(addon = %fault.addon_id, phase = %fault.phase, "{}", fault);
        } else {
            tracing::warn!(addon = %fault.addon_id, phase = %fault.phase, "{}", fault);
        }
        self.faults.push(fault);
    }

    fn emergency_disable(&mut self, id: &str) {
        let Some(loaded) = self.loaded.remove(id) else {
            return;
        };
        let was_enabled = self.enable_order.iter().any(|e| e == id);
        self.enable_order.retain(|e| e != id);
        self.release_host_resources(id, &loaded.context);

        if was_enabled {
            loaded.context.set_phase(AddonPhase::Disable);
            if let Err(cause) = run_hook(&loaded.namespace, |addon| addon.on_disable(&loaded.context)) {
                self.record(AddonFault::new(id, AddonPhase::Disable, false, "disable hook failed", Some(cause)));
            }
            self.disable_order.push(id.to_string());
        }
        loaded.namespace.close();
        tracing::warn!(addon = id, "Addon torn down after fatal fault");
    }

    fn release_host_resources(&self, id: &str, context: &AddonContext) {
        let exposures = context.retract_all();
        let host = self.session.host();
        let extensions = host.extensions.retract_owner(id);
        let listeners = host.events.unsubscribe_owner(id);
        tracing::debug!(addon = id, exposures, extensions, listeners, "Released host resources");
    }

    fn materialize_exposures(&self, id: &str) -> Result<(), String> {
        let Some(loaded) = self.loaded.get(id) else {
            return Ok(());
        };
        let directory = &self.session.host().directory;
        for request in loaded.context.take_pending() {
            match directory.expose(id, request.symbol, request.instance, request.priority) {
                Ok(exposure) => loaded.context.record_exposure(request.symbol, exposure),
                Err(e) => return Err(format!("{}: {}", request.symbol, e)),
            }
        }
        Ok(())
    }
}

/// Lists bundles, creating the directory if it does not exist yet.
fn list_bundles(dir: &Path) -> Result<Vec<PathBuf>, SessionError> {
    let to_session = |source| SessionError::BundleDirectory {
        path: dir.to_path_buf(),
        source,
    };
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(to_session)?;
    }
    Bundle::list(dir).map_err(to_session)
}

/// Runs a hook inside the fault boundary.
fn run_hook(
    namespace: &IsolatedNamespace,
    hook: impl FnOnce(&mut dyn Addon) -> Result<(), HookError>,
) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| namespace.with_instance(hook))) {
        Ok(Some(Ok(()))) => Ok(()),
        Ok(Some(Err(e))) => Err(e.to_string()),
        Ok(None) => Err("namespace has no live instance".to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Checks the running instance reports exactly the declared id and version.
fn verify_identity(namespace: &IsolatedNamespace, meta: &AddonMetadata) -> Result<(), String> {
    let reported = panic::catch_unwind(AssertUnwindSafe(|| {
        namespace.with_instance(|addon| (addon.id().to_string(), addon.version().to_string()))
    }));
    let (id, version) = match reported {
        Ok(Some(pair)) => pair,
        Ok(None) => return Err("namespace has no live instance".to_string()),
        Err(payload) => return Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    };

    if id != meta.id {
        return Err(format!("instance reports id '{}', declared '{}'", id, meta.id));
    }
    match Version::parse(&version) {
        Ok(v) if v == meta.version => Ok(()),
        Ok(v) => Err(format!(
            "instance reports version {}, declared {}",
            v, meta.version
        )),
        Err(e) => Err(format!("instance reports invalid version '{}': {}", version, e)),
    }
}
