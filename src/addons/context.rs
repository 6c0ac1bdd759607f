//! Per-addon capability-scoped context.
//!
//! Every addon receives exactly one [`AddonContext`], bound to its id and
//! namespace. All host access goes through it.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::api::{Capability, ErasedInstance, erase};
use super::error::{AddonPhase, CapabilityContractError, ExtensionKeyError};
use super::host::{ExposureId, Payload};
use super::metadata::AddonMetadata;
use super::state::{AddonSession, AddonState};
use crate::version::Version;

/// Logger tagged with the addon id and its current phase.
#[derive(Debug, Clone)]
pub struct AddonLogger {
    addon_id: Arc<str>,
    phase: Arc<Mutex<AddonPhase>>,
}

impl AddonLogger {
    fn new(addon_id: &str, phase: Arc<Mutex<AddonPhase>>) -> Self {
        Self {
            addon_id: Arc::from(addon_id),
            phase,
        }
    }

    /// Emits a record at `level` with extra key-value fields.
    pub fn log(&self, level: tracing::Level, message: &str, fields: &[(&str, &str)]) {
        let phase = *self.phase.lock();
        let fields = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let addon = &*self.addon_id;
        match level {
            tracing::Level::ERROR => tracing::error!(addon, %phase, fields = %fields, "{}", message),
            tracing::Level::WARN => tracing::warn!(addon, %phase, fields = %fields, "{}", message),
            tracing::Level::INFO => tracing::info!(addon, %phase, fields = %fields, "{}", message),
            tracing::Level::DEBUG => tracing::debug!(addon, %phase, fields = %fields, "{}", message),
            _ => tracing::trace!(addon, %phase, fields = %fields, "{}", message),
        }
    }

    /// Info record.
    pub fn info(&self, message: &str) {
        self.log(tracing::Level::INFO, message, &[]);
    }

    /// Warning record.
    pub fn warn(&self, message: &str) {
        self.log(tracing::Level::WARN, message, &[]);
    }

    /// Error record.
    pub fn error(&self, message: &str) {
        self.log(tracing::Level::ERROR, message, &[]);
    }

    /// Debug record.
    pub fn debug(&self, message: &str) {
        self.log(tracing::Level::DEBUG, message, &[]);
    }
}

/// An exposure requested before the addon was enabled.
pub(crate) struct PendingExposure {
    pub(crate) symbol: &'static str,
    pub(crate) instance: ErasedInstance,
    pub(crate) priority: i32,
}

/// Capability-scoped façade handed to one addon.
pub struct AddonContext {
    metadata: Arc<AddonMetadata>,
    session: Arc<AddonSession>,
    data_dir: PathBuf,
    phase: Arc<Mutex<AddonPhase>>,
    logger: AddonLogger,
    pending: Mutex<Vec<PendingExposure>>,
    exposed: Mutex<Vec<(String, ExposureId)>>,
}

impl std::fmt::Debug for AddonContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonContext")
            .field("addon", &self.metadata.id)
            .field("phase", &self.phase())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl AddonContext {
    /// Creates the context for a freshly loaded addon.
    pub(crate) fn new(
        metadata: Arc<AddonMetadata>,
        session: Arc<AddonSession>,
        data_dir: PathBuf,
    ) -> Self {
        let phase = Arc::new(Mutex::new(AddonPhase::Load));
        let logger = AddonLogger::new(&metadata.id, Arc::clone(&phase));
        Self {
            metadata,
            session,
            data_dir,
            phase,
            logger,
            pending: Mutex::new(Vec::new()),
            exposed: Mutex::new(Vec::new()),
        }
    }

    /// The addon's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Namespace that prefixes the addon's extension keys.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata.namespace()
    }

    /// Declared metadata.
    #[must_use]
    pub fn metadata(&self) -> &AddonMetadata {
        &self.metadata
    }

    /// Logger scoped to this addon.
    #[must_use]
    pub fn logger(&self) -> &AddonLogger {
        &self.logger
    }

    /// The addon's sandboxed data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Host version.
    #[must_use]
    pub fn host_version(&self) -> &Version {
        self.session.host_version()
    }

    /// Host contract level.
    #[must_use]
    pub fn contract_level(&self) -> u32 {
        self.session.contract_level()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> AddonPhase {
        *self.phase.lock()
    }

    /// Registers this addon as the provider of `T`.
    pub fn register_capability<T: Capability + ?Sized>(
        &self,
        instance: Arc<T>,
    ) -> Result<(), CapabilityContractError> {
        self.session.registry().register(self.id(), instance)
    }

    /// Resolves `T` if its provider is currently enabled.
    pub fn get_capability<T: Capability + ?Sized>(
        &self,
    ) -> Result<Option<Arc<T>>, CapabilityContractError> {
        let states = self.session.states();
        self.session
            .registry()
            .resolve_if_enabled::<T>(self.id(), &|id| states.get(id))
    }

    /// Publishes `T` through the host's service directory.
    ///
    /// Before the addon is enabled the request is queued and only takes
    /// effect on a successful enable; it is discarded otherwise.
    pub fn expose_capability<T: Capability + ?Sized>(
        &self,
        instance: Arc<T>,
        priority: i32,
    ) -> Result<(), CapabilityContractError> {
        if !self.session.contract().is_shared(T::SYMBOL) {
            return Err(CapabilityContractError::NotShared {
                symbol: T::SYMBOL.to_string(),
            });
        }

        match self.session.states().get(self.id()) {
            Some(AddonState::Enabled) => {
                let id = self
                    .session
                    .host()
                    .directory
                    .expose(self.id(), T::SYMBOL, erase(instance), priority)
                    .map_err(|e| CapabilityContractError::ExposureRefused {
                        symbol: T::SYMBOL.to_string(),
                        reason: e.to_string(),
                    })?;
                self.exposed.lock().push((T::SYMBOL.to_string(), id));
                Ok(())
            }
            Some(AddonState::Discovered | AddonState::Loaded) => {
                self.pending.lock().push(PendingExposure {
                    symbol: T::SYMBOL,
                    instance: erase(instance),
                    priority,
                });
                tracing::debug!(addon = self.id(), symbol = T::SYMBOL, "Exposure queued until enable");
                Ok(())
            }
            state => Err(CapabilityContractError::ExposureRefused {
                symbol: T::SYMBOL.to_string(),
                reason: format!(
                    "addon is {}",
                    state.map_or_else(|| "unknown".to_string(), |s| s.to_string())
                ),
            }),
        }
    }

    /// Registers `value` at an extension point.
    ///
    /// `key` must be `<namespace>:<name>` with this addon's namespace.
    pub fn register_extension<V: Any + Send + Sync>(
        &self,
        point: &str,
        key: &str,
        value: V,
    ) -> Result<(), ExtensionKeyError> {
        let expected = self.namespace();
        let name = key
            .strip_prefix(expected)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| ExtensionKeyError::WrongNamespace {
                key: key.to_string(),
                expected: expected.to_string(),
            })?;
        if name.trim().is_empty() {
            return Err(ExtensionKeyError::EmptyName(key.to_string()));
        }
        self.session
            .host()
            .extensions
            .register(self.id(), point, key, Arc::new(value))
    }

    /// Subscribes to a host event topic.
    pub fn subscribe<F>(&self, topic: &str, listener: F)
    where
        F: Fn(&str, &Payload) + Send + Sync + 'static,
    {
        self.session
            .host()
            .events
            .subscribe(self.id(), topic, Arc::new(listener));
    }

    /// Runs `task` synchronously through the host scheduler.
    pub fn run_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.session.host().scheduler.run_sync(self.id(), Box::new(task));
    }

    /// Schedules `task` in the background. Not cancelled on disable.
    pub fn run_task_async<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.session
            .host()
            .scheduler
            .run_async(self.id(), Box::new(task));
    }

    pub(crate) fn set_phase(&self, phase: AddonPhase) {
        *self.phase.lock() = phase;
    }

    pub(crate) fn take_pending(&self) -> Vec<PendingExposure> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub(crate) fn record_exposure(&self, symbol: &str, id: ExposureId) {
        self.exposed.lock().push((symbol.to_string(), id));
    }

    /// Withdraws everything this addon exposed or queued.
    pub(crate) fn retract_all(&self) -> usize {
        self.pending.lock().clear();
        let exposed = std::mem::take(&mut *self.exposed.lock());
        let directory = &self.session.host().directory;
        exposed
            .into_iter()
            .filter(|(symbol, id)| {
                let retracted = directory.retract(*id);
                tracing::debug!(addon = self.id(), symbol = %symbol, retracted, "Exposure retracted");
                retracted
            })
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::addons::host::TokioScheduler;
    use crate::addons::metadata::Descriptor;
    use crate::addons::namespace::SharedContract;
    use tempfile::TempDir;

    trait Clock: Send + Sync {
        fn now(&self) -> u64;
    }

    impl Capability for dyn Clock {
        const SYMBOL: &'static str = "engine.api.Clock";
    }

    trait Hidden: Send + Sync {}

    impl Capability for dyn Hidden {
        const SYMBOL: &'static str = "com.acme.Hidden";
    }

    struct Fixed;

    impl Clock for Fixed {
        fn now(&self) -> u64 {
            42
        }
    }

    struct Nothing;

    impl Hidden for Nothing {}

    fn context(tmp: &TempDir, runtime: &tokio::runtime::Runtime) -> AddonContext {
        let session = AddonSession::builder(
            tmp.path().join("data"),
            Arc::new(TokioScheduler::new(runtime.handle().clone())),
        )
        .contract(SharedContract::default().publish("engine.api.Clock"))
        .build();
        let d = Descriptor::from_pairs([
            ("id", "acme:clock"),
            ("version", "1.0.0"),
            ("contract-level", "1"),
            ("entry", "com.acme.clock.Main"),
        ]);
        let meta = Arc::new(AddonMetadata::from_descriptor(&d).expect("metadata"));
        session.states().insert("acme:clock", AddonState::Discovered);
        AddonContext::new(meta, session, tmp.path().join("data/acme-clock"))
    }

    #[test]
    fn test_exposure_queued_until_enabled() {
        let tmp = TempDir::new().expect("tempdir");
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let ctx = context(&tmp, &runtime);

        let clock: Arc<dyn Clock> = Arc::new(Fixed);
        ctx.expose_capability(Arc::clone(&clock), 5).expect("queue");
        assert!(ctx.session.host().directory.lookup("engine.api.Clock").is_none());
        assert_eq!(ctx.take_pending().len(), 1);

        assert!(ctx.session.states().transition("acme:clock", AddonState::Loaded));
        assert!(ctx.session.states().transition("acme:clock", AddonState::Enabled));
        ctx.expose_capability(clock, 5).expect("expose");
        assert!(ctx.session.host().directory.lookup("engine.api.Clock").is_some());

        assert_eq!(ctx.retract_all(), 1);
        assert!(ctx.session.host().directory.lookup("engine.api.Clock").is_none());
    }

    #[test]
    fn test_exposure_refused_after_failure() {
        let tmp = TempDir::new().expect("tempdir");
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let ctx = context(&tmp, &runtime);
        assert!(ctx.session.states().transition("acme:clock", AddonState::Failed));

        let clock: Arc<dyn Clock> = Arc::new(Fixed);
        assert!(matches!(
            ctx.expose_capability(clock, 0),
            Err(CapabilityContractError::ExposureRefused { .. })
        ));
        let hidden: Arc<dyn Hidden> = Arc::new(Nothing);
        assert!(matches!(
            ctx.expose_capability(hidden, 0),
            Err(CapabilityContractError::NotShared { .. })
        ));
    }

    #[test]
    fn test_extension_keys_must_use_own_namespace() {
        let tmp = TempDir::new().expect("tempdir");
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let ctx = context(&tmp, &runtime);

        ctx.register_extension("commands", "acme:tick", 1_u8).expect("register");
        assert_eq!(
            ctx.register_extension("commands", "other:tick", 1_u8),
            Err(ExtensionKeyError::WrongNamespace {
                key: "other:tick".to_string(),
                expected: "acme".to_string(),
            })
        );
        assert!(matches!(
            ctx.register_extension("commands", "acmex:tick", 1_u8),
            Err(ExtensionKeyError::WrongNamespace { .. })
        ));
        assert_eq!(
            ctx.register_extension("commands", "acme:", 1_u8),
            Err(ExtensionKeyError::EmptyName("acme:".to_string()))
        );
        assert!(matches!(
            ctx.register_extension("commands", "acme:tick", 2_u8),
            Err(ExtensionKeyError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_capability_round_trip_through_registry() {
        let tmp = TempDir::new().expect("tempdir");
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let ctx = context(&tmp, &runtime);

        let clock: Arc<dyn Clock> = Arc::new(Fixed);
        ctx.register_capability(clock).expect("register");
        assert!(ctx.get_capability::<dyn Clock>().expect("get").is_none());

        assert!(ctx.session.states().transition("acme:clock", AddonState::Loaded));
        assert!(ctx.session.states().transition("acme:clock", AddonState::Enabled));
        let found = ctx.get_capability::<dyn Clock>().expect("get").expect("clock");
        assert_eq!(found.now(), 42);
        assert_eq!(ctx.contract_level(), 1);
        assert_eq!(ctx.host_version(), &Version::new(1, 0, 0));
        assert_eq!(ctx.phase(), AddonPhase::Load);
    }
}
