//! Addon lifecycle and isolation subsystem.
//!
//! Discovers addon bundles, audits them, resolves their dependency graph
//! and drives each addon through load, enable and disable inside its own
//! isolated namespace.
//!
//! # Architecture
//!
//! - **metadata / bundle**: `addon.toml` descriptors inside zip bundles
//! - **audit**: static compliance lint over compiled units
//! - **resolver**: eligibility, load order, optional-order stabilization
//! - **namespace**: shared contract, isolated namespaces, entry points
//! - **datadir**: sandboxed per-addon data directories
//! - **services**: capability registry gated by provider state
//! - **host**: event bus, service directory, scheduler, extension points
//! - **context**: the façade each addon receives
//! - **manager**: the lifecycle orchestrator
//!
//! # Usage
//!
//! ```ignore
//! use addonhost::addons::{AddonManager, AddonSession, EntryPoints, TokioScheduler};
//!
//! let session = AddonSession::builder(data_root, Arc::new(TokioScheduler::new(handle))).build();
//! let entry_points = Arc::new(EntryPoints::new());
//! entry_points.register("com.acme.storage.StorageAddon", || Ok(Box::new(StorageAddon::default())));
//!
//! let mut manager = AddonManager::new(session, entry_points, addons_dir);
//! manager.discover()?;
//! manager.load_all();
//! manager.enable_all();
//! // ... run the engine
//! manager.disable_all();
//! ```

mod api;
pub mod audit;
mod bundle;
mod context;
mod datadir;
mod error;
pub mod host;
mod manager;
mod metadata;
mod namespace;
mod resolver;
mod services;
mod state;

pub use api::{Addon, Capability, ErasedInstance};
pub use audit::{AuditIndex, AuditReport, ComplianceAuditor, Violation, ViolationKind};
pub use bundle::{BUNDLE_EXTENSIONS, Bundle, NESTED_LIBRARY_EXTENSIONS, UNIT_EXTENSION, UnitEntry};
pub use context::{AddonContext, AddonLogger};
pub use datadir::{AddonDataDirectorySystem, safe_dir_name};
pub use error::{
    AddonFault, AddonPhase, BundleError, CapabilityContractError, DirectoryError,
    ExtensionKeyError, HookError, MetadataError, SandboxError, SessionError,
};
pub use host::{
    EventBus, ExposureId, ExtensionPoints, ExtensionValue, HostServices, Listener, LocalEventBus,
    LocalServiceDirectory, Payload, ServiceDirectory, Task, TaskScheduler, TokioScheduler,
};
pub use manager::{AddonManager, DiscoveryReport, SkippedBundle};
pub use metadata::{AddonMetadata, DESCRIPTOR_NAME, DependencySpec, Descriptor, parse_dependency_list};
pub use namespace::{
    DEFAULT_CONTRACT_PREFIX, EntryFactory, EntryPoints, IsolatedNamespace, NamespaceError,
    SharedContract, SymbolOrigin,
};
pub use resolver::{
    AddonDependencyResolver, DependencyFailure, Resolution, ResolutionWarning, WarningKind,
};
pub use services::{
    AddonServiceRegistry, DEFAULT_EVICT_THRESHOLD, DEFAULT_LOG_WINDOW, LogThrottle,
    ResolveOutcome, ServiceSettings, ThrottleKey,
};
pub use state::{AddonSession, AddonState, SessionBuilder, StateTable};
