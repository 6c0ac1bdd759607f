//! Lifecycle states and the per-session object.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::datadir::AddonDataDirectorySystem;
use super::host::{EventBus, HostServices, ServiceDirectory, TaskScheduler};
use super::namespace::SharedContract;
use super::services::{AddonServiceRegistry, ServiceSettings};
use crate::version::Version;

/// Lifecycle state of one addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddonState {
    /// Metadata parsed and eligible for loading.
    Discovered,
    /// Load-hook completed.
    Loaded,
    /// Enable-hook completed and capabilities exposed.
    Enabled,
    /// Failed; terminal for the session.
    Failed,
    /// Shut down; terminal for the session.
    Disabled,
}

impl AddonState {
    /// Returns true for FAILED and DISABLED.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Disabled)
    }

    /// Returns true if the lifecycle allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use AddonState::{Disabled, Discovered, Enabled, Failed, Loaded};
        matches!(
            (self, next),
            (Discovered, Loaded)
                | (Loaded, Enabled)
                | (Loaded, Disabled)
                | (Enabled, Disabled)
                | (Discovered | Loaded | Enabled, Failed)
        )
    }
}

impl fmt::Display for AddonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Discovered => "DISCOVERED",
            Self::Loaded => "LOADED",
            Self::Enabled => "ENABLED",
            Self::Failed => "FAILED",
            Self::Disabled => "DISABLED",
        };
        f.write_str(text)
    }
}

/// Shared view of every addon's state.
///
/// Cheap to clone; all clones see the same table. Only the manager writes.
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    inner: Arc<RwLock<BTreeMap<String, AddonState>>>,
}

impl StateTable {
    /// State of `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<AddonState> {
        self.inner.read().get(id).copied()
    }

    /// Copy of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, AddonState> {
        self.inner.read().clone()
    }

    /// Ids currently in `state`, sorted.
    #[must_use]
    pub fn ids_in(&self, state: AddonState) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sets the initial state of an id, replacing nothing that exists.
    pub(crate) fn insert(&self, id: &str, state: AddonState) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(id) {
            return false;
        }
        inner.insert(id.to_string(), state);
        true
    }

    /// Applies an allowed transition. Returns false and leaves the table
    /// unchanged otherwise.
    pub(crate) fn transition(&self, id: &str, next: AddonState) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(current) if current.can_transition_to(next) => {
                tracing::debug!(addon = id, from = %current, to = %next, "State transition");
                *current = next;
                true
            }
            Some(current) => {
                tracing::warn!(addon = id, from = %*current, to = %next, "Refused state transition");
                false
            }
            None => false,
        }
    }
}

/// Everything one addon session shares.
///
/// Shared by `Arc` with every addon context.
#[derive(Debug)]
pub struct AddonSession {
    contract: Arc<SharedContract>,
    states: StateTable,
    registry: AddonServiceRegistry,
    datadirs: AddonDataDirectorySystem,
    host: HostServices,
    host_version: Version,
    contract_level: u32,
}

impl AddonSession {
    /// Starts building a session.
    #[must_use]
    pub fn builder(data_root: impl Into<PathBuf>, scheduler: Arc<dyn TaskScheduler>) -> SessionBuilder {
        SessionBuilder {
            data_root: data_root.into(),
            scheduler,
            contract: SharedContract::default(),
            host_version: Version::new(1, 0, 0),
            contract_level: 1,
            settings: ServiceSettings::default(),
            events: None,
            directory: None,
        }
    }

    /// The shared contract.
    #[must_use]
    pub fn contract(&self) -> &Arc<SharedContract> {
        &self.contract
    }

    /// The state table.
    #[must_use]
    pub fn states(&self) -> &StateTable {
        &self.states
    }

    /// The capability registry.
    #[must_use]
    pub fn registry(&self) -> &AddonServiceRegistry {
        &self.registry
    }

    /// The data-directory system.
    #[must_use]
    pub fn datadirs(&self) -> &AddonDataDirectorySystem {
        &self.datadirs
    }

    /// Host collaborators.
    #[must_use]
    pub fn host(&self) -> &HostServices {
        &self.host
    }

    /// Host version reported to addons.
    #[must_use]
    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Contract level the host provides.
    #[must_use]
    pub fn contract_level(&self) -> u32 {
        self.contract_level
    }
}

/// Builder for [`AddonSession`].
pub struct SessionBuilder {
    data_root: PathBuf,
    scheduler: Arc<dyn TaskScheduler>,
    contract: SharedContract,
    host_version: Version,
    contract_level: u32,
    settings: ServiceSettings,
    events: Option<Arc<dyn EventBus>>,
    directory: Option<Arc<dyn ServiceDirectory>>,
}

impl SessionBuilder {
    /// Shared contract; defaults to an empty `engine.api.` contract.
    #[must_use]
    pub fn contract(mut self, contract: SharedContract) -> Self {
        self.contract = contract;
        self
    }

    /// Host version; defaults to `1.0.0`.
    #[must_use]
    pub fn host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    /// Contract level; defaults to `1`.
    #[must_use]
    pub fn contract_level(mut self, level: u32) -> Self {
        self.contract_level = level;
        self
    }

    /// Registry tunables.
    #[must_use]
    pub fn service_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the in-process event bus.
    #[must_use]
    pub fn event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replaces the in-process service directory.
    #[must_use]
    pub fn service_directory(mut self, directory: Arc<dyn ServiceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Builds the session.
    #[must_use]
    pub fn build(self) -> Arc<AddonSession> {
        let states = StateTable::default();
        let mut host = HostServices::local(&states, self.scheduler);
        if let Some(events) = self.events {
            host.events = events;
        }
        if let Some(directory) = self.directory {
            host.directory = directory;
        }
        let contract = Arc::new(self.contract);

        Arc::new(AddonSession {
            registry: AddonServiceRegistry::new(Arc::clone(&contract), self.settings),
            datadirs: AddonDataDirectorySystem::new(self.data_root),
            contract,
            states,
            host,
            host_version: self.host_version,
            contract_level: self.contract_level,
        })
    }
}
