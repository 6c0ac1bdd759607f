//! Host collaborators consumed by the addon subsystem.
//!
//! The engine's event bus, cluster-visible service directory, task
//! scheduler and extension-point table are reached through traits so a
//! host can plug in its own. The `Local*` and [`TokioScheduler`] types are
//! in-process implementations used by the CLI and tests.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::api::ErasedInstance;
use super::error::{DirectoryError, ExtensionKeyError, panic_message};
use super::state::{AddonState, StateTable};

/// Event payload.
pub type Payload = serde_json::Value;

/// Event listener callback: `(topic, payload)`.
pub type Listener = Arc<dyn Fn(&str, &Payload) + Send + Sync>;

/// Publish/subscribe bus.
pub trait EventBus: Send + Sync {
    /// Registers a listener for `topic` on behalf of `owner`.
    fn subscribe(&self, owner: &str, topic: &str, listener: Listener);

    /// Delivers `payload` to every listener of `topic`. Returns the number
    /// of listeners that completed without panicking.
    fn publish(&self, topic: &str, payload: &Payload) -> usize;

    /// Removes all listeners of `owner`. Returns how many were removed.
    fn unsubscribe_owner(&self, owner: &str) -> usize;
}

struct Subscription {
    owner: String,
    topic: String,
    listener: Listener,
}

/// In-process [`EventBus`].
#[derive(Default)]
pub struct LocalEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl LocalEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(&self, owner: &str, topic: &str, listener: Listener) {
        self.subscriptions.write().push(Subscription {
            owner: owner.to_string(),
            topic: topic.to_string(),
            listener,
        });
    }

    fn publish(&self, topic: &str, payload: &Payload) -> usize {
        // Listeners run outside the lock so they may subscribe or publish.
        let targets: Vec<(String, Listener)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| (s.owner.clone(), Arc::clone(&s.listener)))
            .collect();

        let mut delivered = 0;
        for (owner, listener) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(topic, payload))) {
                Ok(()) => delivered += 1,
                Err(p) => tracing::error!(
                    addon = %owner,
                    topic,
                    "Event listener panicked: {}",
                    panic_message(p.as_ref())
                ),
            }
        }
        delivered
    }

    fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.owner != owner);
        before - subscriptions.len()
    }
}

/// Handle to one exposure in a [`ServiceDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExposureId(Uuid);

impl ExposureId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-visible service directory.
pub trait ServiceDirectory: Send + Sync {
    /// Publishes `instance` under `symbol` with a priority.
    fn expose(
        &self,
        owner: &str,
        symbol: &str,
        instance: ErasedInstance,
        priority: i32,
    ) -> Result<ExposureId, DirectoryError>;

    /// Withdraws an exposure. Returns false if it was unknown.
    fn retract(&self, id: ExposureId) -> bool;

    /// Highest-priority instance for `symbol`.
    fn lookup(&self, symbol: &str) -> Option<ErasedInstance>;

    /// `(owner, priority)` of every exposure for `symbol`, best first.
    fn providers(&self, symbol: &str) -> Vec<(String, i32)>;
}

struct Exposure {
    id: ExposureId,
    owner: String,
    symbol: String,
    instance: ErasedInstance,
    priority: i32,
}

/// In-process [`ServiceDirectory`].
///
/// Refuses exposures from owners that are not ENABLED.
pub struct LocalServiceDirectory {
    states: StateTable,
    exposures: RwLock<Vec<Exposure>>,
}

impl LocalServiceDirectory {
    /// Creates a directory gated on `states`.
    #[must_use]
    pub fn new(states: StateTable) -> Self {
        Self {
            states,
            exposures: RwLock::new(Vec::new()),
        }
    }

    /// Number of live exposures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exposures.read().len()
    }

    /// Returns true if nothing is exposed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ServiceDirectory for LocalServiceDirectory {
    fn expose(
        &self,
        owner: &str,
        symbol: &str,
        instance: ErasedInstance,
        priority: i32,
    ) -> Result<ExposureId, DirectoryError> {
        if self.states.get(owner) != Some(AddonState::Enabled) {
            return Err(DirectoryError::OwnerNotEnabled(owner.to_string()));
        }
        let id = ExposureId::new();
        let mut exposures = self.exposures.write();
        exposures.push(Exposure {
            id,
            owner: owner.to_string(),
            symbol: symbol.to_string(),
            instance,
            priority,
        });
        // Stable sort keeps first-come order within a priority.
        exposures.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(id)
    }

    fn retract(&self, id: ExposureId) -> bool {
        let mut exposures = self.exposures.write();
        let before = exposures.len();
        exposures.retain(|e| e.id != id);
        before != exposures.len()
    }

    fn lookup(&self, symbol: &str) -> Option<ErasedInstance> {
        self.exposures
            .read()
            .iter()
            .find(|e| e.symbol == symbol)
            .map(|e| Arc::clone(&e.instance))
    }

    fn providers(&self, symbol: &str) -> Vec<(String, i32)> {
        self.exposures
            .read()
            .iter()
            .filter(|e| e.symbol == symbol)
            .map(|e| (e.owner.clone(), e.priority))
            .collect()
    }
}

/// Unit of scheduled work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Host task runner.
///
/// Work scheduled here is not tracked per addon and is not cancelled
/// when its owner is disabled.
pub trait TaskScheduler: Send + Sync {
    /// Runs `task` on the calling thread.
    fn run_sync(&self, owner: &str, task: Task);

    /// Runs `task` in the background.
    fn run_async(&self, owner: &str, task: Task);
}

/// [`TaskScheduler`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Uses the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the current context, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl TaskScheduler for TokioScheduler {
    fn run_sync(&self, owner: &str, task: Task) {
        if let Err(p) = panic::catch_unwind(AssertUnwindSafe(task)) {
            tracing::error!(addon = owner, "Scheduled task panicked: {}", panic_message(p.as_ref()));
        }
    }

    fn run_async(&self, owner: &str, task: Task) {
        let owner = owner.to_string();
        drop(self.handle.spawn_blocking(move || {
            if let Err(p) = panic::catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!(addon = %owner, "Background task panicked: {}", panic_message(p.as_ref()));
            }
        }));
    }
}

/// Value stored at an extension point.
pub type ExtensionValue = Arc<dyn Any + Send + Sync>;

struct Extension {
    owner: String,
    value: ExtensionValue,
}

/// Extension points keyed by point name, then by namespaced key.
#[derive(Default)]
pub struct ExtensionPoints {
    points: RwLock<BTreeMap<String, BTreeMap<String, Extension>>>,
}

impl ExtensionPoints {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        owner: &str,
        point: &str,
        key: &str,
        value: ExtensionValue,
    ) -> Result<(), ExtensionKeyError> {
        let mut points = self.points.write();
        let slot = points.entry(point.to_string()).or_default();
        if slot.contains_key(key) {
            return Err(ExtensionKeyError::Duplicate {
                point: point.to_string(),
                key: key.to_string(),
            });
        }
        slot.insert(
            key.to_string(),
            Extension {
                owner: owner.to_string(),
                value,
            },
        );
        Ok(())
    }

    /// Value registered at `point` under `key`.
    #[must_use]
    pub fn get(&self, point: &str, key: &str) -> Option<ExtensionValue> {
        self.points
            .read()
            .get(point)
            .and_then(|slot| slot.get(key))
            .map(|e| Arc::clone(&e.value))
    }

    /// Keys registered at `point`, sorted.
    #[must_use]
    pub fn keys(&self, point: &str) -> Vec<String> {
        self.points
            .read()
            .get(point)
            .map(|slot| slot.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every registration of `owner`. Returns how many were removed.
    pub fn retract_owner(&self, owner: &str) -> usize {
        let mut removed = 0;
        let mut points = self.points.write();
        for slot in points.values_mut() {
            let before = slot.len();
            slot.retain(|_, e| e.owner != owner);
            removed += before - slot.len();
        }
        points.retain(|_, slot| !slot.is_empty());
        removed
    }
}

/// Bundle of host collaborators handed to the session.
#[derive(Clone)]
pub struct HostServices {
    /// Event bus.
    pub events: Arc<dyn EventBus>,
    /// Service directory.
    pub directory: Arc<dyn ServiceDirectory>,
    /// Task scheduler.
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Extension points.
    pub extensions: Arc<ExtensionPoints>,
}

impl HostServices {
    /// In-process collaborators gated on `states`.
    #[must_use]
    pub fn local(states: &StateTable, scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            events: Arc::new(LocalEventBus::new()),
            directory: Arc::new(LocalServiceDirectory::new(states.clone())),
            scheduler,
            extensions: Arc::new(ExtensionPoints::new()),
        }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}
