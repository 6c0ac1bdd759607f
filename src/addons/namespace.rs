//! Isolated symbol namespaces.
//!
//! Every bundle is loaded into its own [`IsolatedNamespace`]: a symbol
//! table holding only the symbols the bundle's compiled units declare,
//! rooted in the read-only [`SharedContract`]. Entry symbols are bound to
//! factories from the host-linked [`EntryPoints`] registry. No namespace
//! can resolve another namespace's symbols.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::api::Addon;
use super::error::{HookError, panic_message};

/// Default prefix of the shared-contract namespace.
pub const DEFAULT_CONTRACT_PREFIX: &str = "engine.api.";

/// The symbols the host publishes to every addon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContract {
    prefix: String,
    published: BTreeSet<String>,
}

impl Default for SharedContract {
    fn default() -> Self {
        Self::new(DEFAULT_CONTRACT_PREFIX)
    }
}

impl SharedContract {
    /// Creates an empty contract rooted at `prefix`.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        assert!(!prefix.is_empty(), "contract prefix must not be empty");
        let prefix = if prefix.ends_with('.') {
            prefix.to_string()
        } else {
            format!("{}.", prefix)
        };
        Self {
            prefix,
            published: BTreeSet::new(),
        }
    }

    /// Publishes a symbol. Symbols outside the prefix are ignored.
    #[must_use]
    pub fn publish(mut self, symbol: &str) -> Self {
        if self.is_shared(symbol) {
            self.published.insert(symbol.to_string());
        } else {
            tracing::warn!(symbol, prefix = %self.prefix, "Ignoring published symbol outside the contract prefix");
        }
        self
    }

    /// Publishes several symbols.
    #[must_use]
    pub fn with_symbols<'a>(self, symbols: impl IntoIterator<Item = &'a str>) -> Self {
        symbols.into_iter().fold(self, SharedContract::publish)
    }

    /// The namespace prefix, ending in `.`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns true if the symbol lives in the shared-contract namespace.
    #[must_use]
    pub fn is_shared(&self, symbol: &str) -> bool {
        symbol.starts_with(&self.prefix)
    }

    /// Returns true if the host publishes this exact symbol.
    #[must_use]
    pub fn is_published(&self, symbol: &str) -> bool {
        self.published.contains(symbol)
    }

    /// All published symbols.
    pub fn published(&self) -> impl Iterator<Item = &str> {
        self.published.iter().map(String::as_str)
    }
}

/// Factory that instantiates an addon entry point.
pub type EntryFactory = Arc<dyn Fn() -> Result<Box<dyn Addon>, HookError> + Send + Sync>;

/// Host-linked registry mapping entry symbols to factories.
#[derive(Default)]
pub struct EntryPoints {
    factories: RwLock<HashMap<String, EntryFactory>>,
}

impl EntryPoints {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Links a factory to an entry symbol, replacing any previous one.
    pub fn register<F>(&self, symbol: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Addon>, HookError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(symbol.to_string(), Arc::new(factory));
    }

    /// Returns true if a factory is linked for `symbol`.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.factories.read().contains_key(symbol)
    }

    fn get(&self, symbol: &str) -> Option<EntryFactory> {
        self.factories.read().get(symbol).cloned()
    }
}

/// Where a symbol resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOrigin {
    /// Published by the host.
    Shared,
    /// Declared by the namespace's own bundle.
    Local,
}

/// Errors while instantiating an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    /// The namespace has been closed.
    #[error("namespace is closed")]
    Closed,
    /// An instance already exists.
    #[error("entry point already instantiated")]
    AlreadyInstantiated,
    /// The entry symbol is not declared by any unit in the bundle.
    #[error("entry symbol '{0}' is not defined in the bundle")]
    EntryNotDefined(String),
    /// The entry symbol lies in the shared contract.
    #[error("entry symbol '{0}' belongs to the shared contract")]
    EntryInSharedContract(String),
    /// No factory is linked for the entry symbol.
    #[error("entry symbol '{0}' is not linked into the host")]
    EntryNotLinked(String),
    /// The factory returned an error or panicked.
    #[error("entry factory failed: {0}")]
    Factory(String),
}

/// One addon's private symbol table and running instance.
pub struct IsolatedNamespace {
    addon_id: String,
    symbols: BTreeSet<String>,
    contract: Arc<SharedContract>,
    entry_points: Arc<EntryPoints>,
    instance: Mutex<Option<Box<dyn Addon>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for IsolatedNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedNamespace")
            .field("addon_id", &self.addon_id)
            .field("symbols", &self.symbols.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl IsolatedNamespace {
    /// Creates a namespace over the symbols a bundle declares.
    ///
    /// Declared symbols inside the shared-contract prefix are not admitted;
    /// the shared contract always wins.
    #[must_use]
    pub fn new(
        addon_id: &str,
        declared: impl IntoIterator<Item = String>,
        contract: Arc<SharedContract>,
        entry_points: Arc<EntryPoints>,
    ) -> Self {
        let symbols = declared
            .into_iter()
            .filter(|s| !contract.is_shared(s))
            .collect();
        Self {
            addon_id: addon_id.to_string(),
            symbols,
            contract,
            entry_points,
            instance: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Owning addon id.
    #[must_use]
    pub fn addon_id(&self) -> &str {
        &self.addon_id
    }

    /// Resolves a symbol: shared contract first, then local symbols.
    #[must_use]
    pub fn resolve(&self, symbol: &str) -> Option<SymbolOrigin> {
        if self.is_closed() {
            return None;
        }
        if self.contract.is_shared(symbol) {
            return self
                .contract
                .is_published(symbol)
                .then_some(SymbolOrigin::Shared);
        }
        self.symbols
            .contains(symbol)
            .then_some(SymbolOrigin::Local)
    }

    /// Instantiates the entry point and keeps the instance.
    pub fn instantiate(&self, entry: &str) -> Result<(), NamespaceError> {
        if self.is_closed() {
            return Err(NamespaceError::Closed);
        }
        if self.instance.lock().is_some() {
            return Err(NamespaceError::AlreadyInstantiated);
        }
        match self.resolve(entry) {
            Some(SymbolOrigin::Local) => {}
            Some(SymbolOrigin::Shared) => {
                return Err(NamespaceError::EntryInSharedContract(entry.to_string()));
            }
            None if self.contract.is_shared(entry) => {
                return Err(NamespaceError::EntryInSharedContract(entry.to_string()));
            }
            None => return Err(NamespaceError::EntryNotDefined(entry.to_string())),
        }

        let factory = self
            .entry_points
            .get(entry)
            .ok_or_else(|| NamespaceError::EntryNotLinked(entry.to_string()))?;

        let addon = match panic::catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(Ok(addon)) => addon,
            Ok(Err(e)) => return Err(NamespaceError::Factory(e.to_string())),
            Err(payload) => return Err(NamespaceError::Factory(panic_message(payload.as_ref()))),
        };

        *self.instance.lock() = Some(addon);
        tracing::debug!(addon = %self.addon_id, entry, "Entry point instantiated");
        Ok(())
    }

    /// Runs `f` against the instance. Returns `None` if there is none.
    ///
    /// Panics inside `f` propagate; callers wrap this in a fault boundary.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut dyn Addon) -> R) -> Option<R> {
        if self.is_closed() {
            return None;
        }
        let mut guard = self.instance.lock();
        guard.as_mut().map(|addon| f(addon.as_mut()))
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the namespace and drops the instance.
    ///
    /// Idempotent and never panics; a panicking instance destructor is
    /// logged and swallowed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let instance = self.instance.lock().take();
        if let Some(instance) = instance {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(instance))) {
                tracing::warn!(
                    addon = %self.addon_id,
                    "Addon instance panicked while being dropped: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        tracing::debug!(addon = %self.addon_id, "Namespace closed");
    }
}

impl Drop for IsolatedNamespace {
    fn drop(&mut self) {
        self.close();
    }
}
