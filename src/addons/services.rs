//! Capability registry gated by provider liveness.
//!
//! One coarse lock guards all entries. Resolution only clones stored
//! handles under the lock; the provider's state is checked after the lock
//! is released, and no addon code ever runs while it is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::api::{Capability, ErasedInstance, erase, restore};
use super::error::CapabilityContractError;
use super::namespace::SharedContract;
use super::state::AddonState;

/// Default window for throttled resolution logging.
pub const DEFAULT_LOG_WINDOW: Duration = Duration::from_secs(30);

/// Default throttle map size above which stale entries are evicted.
pub const DEFAULT_EVICT_THRESHOLD: usize = 1024;

/// Tunables for the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Minimum interval between identical resolution log records.
    pub log_window: Duration,
    /// Throttle map size that triggers eviction.
    pub evict_threshold: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            log_window: DEFAULT_LOG_WINDOW,
            evict_threshold: DEFAULT_EVICT_THRESHOLD,
        }
    }
}

/// Outcome of a resolution attempt, used for log throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// The instance was returned.
    Resolved,
    /// Nothing is registered for the symbol.
    NotRegistered,
    /// The provider exists but is not enabled.
    ProviderNotEnabled,
    /// The stored instance is not of the requested type.
    TypeMismatch,
}

/// Identity of a throttled log record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// Resolving addon.
    pub requester: String,
    /// Owning addon, empty if none.
    pub provider: String,
    /// Capability symbol.
    pub symbol: String,
    /// Outcome.
    pub outcome: ResolveOutcome,
}

/// Per-key rate limiter on a monotonic clock.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    evict_threshold: usize,
    last: Mutex<HashMap<ThrottleKey, Instant>>,
}

impl LogThrottle {
    /// Creates a throttle.
    #[must_use]
    pub fn new(window: Duration, evict_threshold: usize) -> Self {
        assert!(evict_threshold > 0, "evict threshold must be positive");
        Self {
            window,
            evict_threshold,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if a record for `key` may be emitted at `now`.
    pub fn permit(&self, key: ThrottleKey, now: Instant) -> bool {
        let mut last = self.last.lock();
        if last.len() > self.evict_threshold {
            let window = self.window;
            last.retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }
        match last.get(&key) {
            Some(seen) if now.saturating_duration_since(*seen) < self.window => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.last.lock().len()
    }

    /// Forgets all keys.
    pub fn clear(&self) {
        self.last.lock().clear();
    }
}

struct ServiceEntry {
    owner: String,
    instance: ErasedInstance,
}

/// Capability directory keyed by shared-contract symbol.
pub struct AddonServiceRegistry {
    contract: Arc<SharedContract>,
    entries: Mutex<HashMap<String, ServiceEntry>>,
    throttle: LogThrottle,
}

impl std::fmt::Debug for AddonServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonServiceRegistry")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl AddonServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(contract: Arc<SharedContract>, settings: ServiceSettings) -> Self {
        Self {
            contract,
            entries: Mutex::new(HashMap::new()),
            throttle: LogThrottle::new(settings.log_window, settings.evict_threshold),
        }
    }

    /// Registers `instance` as the provider of `T` for `addon_id`.
    ///
    /// Registering again for the same owner is a no-op and keeps the first
    /// instance. Ownership is sticky for the session.
    pub fn register<T: Capability + ?Sized>(
        &self,
        addon_id: &str,
        instance: Arc<T>,
    ) -> Result<(), CapabilityContractError> {
        self.check_shared(T::SYMBOL)?;

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(T::SYMBOL) {
            if existing.owner == addon_id {
                return Ok(());
            }
            return Err(CapabilityContractError::AlreadyOwned {
                symbol: T::SYMBOL.to_string(),
                owner: existing.owner.clone(),
                requester: addon_id.to_string(),
            });
        }
        entries.insert(
            T::SYMBOL.to_string(),
            ServiceEntry {
                owner: addon_id.to_string(),
                instance: erase(instance),
            },
        );
        drop(entries);

        tracing::debug!(addon = addon_id, symbol = T::SYMBOL, "Capability registered");
        Ok(())
    }

    /// Resolves `T` for `requester_id`.
    ///
    /// Returns the instance only if it is registered, its provider is
    /// ENABLED according to `state_of`, and the stored instance is still a
    /// `T`. Absence is `Ok(None)`; only contract violations are errors.
    pub fn resolve_if_enabled<T: Capability + ?Sized>(
        &self,
        requester_id: &str,
        state_of: &dyn Fn(&str) -> Option<AddonState>,
    ) -> Result<Option<Arc<T>>, CapabilityContractError> {
        self.check_shared(T::SYMBOL)?;

        let found = self
            .entries
            .lock()
            .get(T::SYMBOL)
            .map(|e| (e.owner.clone(), Arc::clone(&e.instance)));

        let (provider, outcome, result) = match found {
            None => (String::new(), ResolveOutcome::NotRegistered, None),
            Some((owner, instance)) => {
                if state_of(&owner) != Some(AddonState::Enabled) {
                    (owner, ResolveOutcome::ProviderNotEnabled, None)
                } else {
                    match restore::<T>(&instance) {
                        Some(typed) => (owner, ResolveOutcome::Resolved, Some(typed)),
                        None => (owner, ResolveOutcome::TypeMismatch, None),
                    }
                }
            }
        };

        let key = ThrottleKey {
            requester: requester_id.to_string(),
            provider,
            symbol: T::SYMBOL.to_string(),
            outcome,
        };
        if self.throttle.permit(key.clone(), Instant::now()) {
            match outcome {
                ResolveOutcome::Resolved => tracing::debug!(
                    requester = %key.requester,
                    provider = %key.provider,
                    symbol = %key.symbol,
                    "Capability resolved"
                ),
                _ => tracing::info!(
                    requester = %key.requester,
                    provider = %key.provider,
                    symbol = %key.symbol,
                    ?outcome,
                    "Capability resolution denied"
                ),
            }
        }

        Ok(result)
    }

    /// Owner of `symbol`, if registered.
    #[must_use]
    pub fn owner_of(&self, symbol: &str) -> Option<String> {
        self.entries.lock().get(symbol).map(|e| e.owner.clone())
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Only called at session end.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
        self.throttle.clear();
    }

    fn check_shared(&self, symbol: &str) -> Result<(), CapabilityContractError> {
        if self.contract.is_shared(symbol) {
            Ok(())
        } else {
            Err(CapabilityContractError::NotShared {
                symbol: symbol.to_string(),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    trait Storage: Send + Sync {
        fn name(&self) -> &str;
    }

    impl Capability for dyn Storage {
        const SYMBOL: &'static str = "engine.api.Storage";
    }

    trait Private: Send + Sync {}

    impl Capability for dyn Private {
        const SYMBOL: &'static str = "com.acme.Private";
    }

    struct Disk(&'static str);

    impl Storage for Disk {
        fn name(&self) -> &str {
            self.0
        }
    }

    struct Secret;

    impl Private for Secret {}

    fn registry() -> AddonServiceRegistry {
        AddonServiceRegistry::new(Arc::new(SharedContract::default()), ServiceSettings::default())
    }

    fn states(pairs: &[(&str, AddonState)]) -> BTreeMap<String, AddonState> {
        pairs.iter().map(|(id, s)| ((*id).to_string(), *s)).collect()
    }

    #[test]
    fn test_resolve_follows_provider_state() {
        let registry = registry();
        let disk: Arc<dyn Storage> = Arc::new(Disk("disk"));
        registry.register("x", disk).expect("register");

        let enabled = states(&[("x", AddonState::Enabled)]);
        let found = registry
            .resolve_if_enabled::<dyn Storage>("y", &|id| enabled.get(id).copied())
            .expect("resolve");
        assert_eq!(found.map(|s| s.name().to_string()), Some("disk".to_string()));

        let disabled = states(&[("x", AddonState::Disabled)]);
        let found = registry
            .resolve_if_enabled::<dyn Storage>("y", &|id| disabled.get(id).copied())
            .expect("resolve");
        assert!(found.is_none());
    }

    #[test]
    fn test_second_owner_is_rejected() {
        let registry = registry();
        let first: Arc<dyn Storage> = Arc::new(Disk("first"));
        let second: Arc<dyn Storage> = Arc::new(Disk("second"));
        registry.register("x", first).expect("register");

        let err = registry.register("y", second).expect_err("second owner");
        assert_eq!(
            err,
            CapabilityContractError::AlreadyOwned {
                symbol: "engine.api.Storage".to_string(),
                owner: "x".to_string(),
                requester: "y".to_string(),
            }
        );
        assert_eq!(registry.owner_of("engine.api.Storage"), Some("x".to_string()));
    }

    #[test]
    fn test_same_owner_is_idempotent() {
        let registry = registry();
        let first: Arc<dyn Storage> = Arc::new(Disk("first"));
        let again: Arc<dyn Storage> = Arc::new(Disk("again"));
        registry.register("x", first).expect("register");
        registry.register("x", again).expect("idempotent");

        let enabled = states(&[("x", AddonState::Enabled)]);
        let found = registry
            .resolve_if_enabled::<dyn Storage>("y", &|id| enabled.get(id).copied())
            .expect("resolve")
            .expect("instance");
        assert_eq!(found.name(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_non_shared_symbols_are_contract_errors() {
        let registry = registry();
        let secret: Arc<dyn Private> = Arc::new(Secret);
        assert!(matches!(
            registry.register("x", secret),
            Err(CapabilityContractError::NotShared { .. })
        ));
        assert!(matches!(
            registry.resolve_if_enabled::<dyn Private>("y", &|_| None),
            Err(CapabilityContractError::NotShared { .. })
        ));
    }

    #[test]
    fn test_unregistered_is_empty() {
        let registry = registry();
        let found = registry
            .resolve_if_enabled::<dyn Storage>("y", &|_| Some(AddonState::Enabled))
            .expect("resolve");
        assert!(found.is_none());
    }

    fn key(requester: &str) -> ThrottleKey {
        ThrottleKey {
            requester: requester.to_string(),
            provider: "x".to_string(),
            symbol: "engine.api.Storage".to_string(),
            outcome: ResolveOutcome::Resolved,
        }
    }

    #[test]
    fn test_throttle_window() {
        let throttle = LogThrottle::new(Duration::from_secs(30), 16);
        let start = Instant::now();

        assert!(throttle.permit(key("y"), start));
        assert!(!throttle.permit(key("y"), start + Duration::from_secs(10)));
        assert!(throttle.permit(key("z"), start + Duration::from_secs(10)));
        assert!(throttle.permit(key("y"), start + Duration::from_secs(31)));
    }

    #[test]
    fn test_throttle_evicts_stale_entries() {
        let throttle = LogThrottle::new(Duration::from_secs(1), 4);
        let start = Instant::now();
        for i in 0..6 {
            assert!(throttle.permit(key(&format!("r{}", i)), start));
        }
        assert_eq!(throttle.tracked(), 6);

        assert!(throttle.permit(key("late"), start + Duration::from_secs(5)));
        assert_eq!(throttle.tracked(), 1);
    }
}
