//! Addonhost
//!
//! Addon lifecycle and isolation subsystem for an extensible server-side
//! engine.
//!
//! # Architecture
//!
//! - **Addons Module**: discovery, audit, dependency resolution, isolated
//!   loading and the phased lifecycle
//! - **Version Module**: semantic versions with standard precedence
//! - **Config Module**: host configuration from TOML
//! - **Logging Module**: file and stderr tracing setup
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use addonhost::addons::{AddonManager, EntryPoints, TokioScheduler};
//! use addonhost::config::HostConfig;
//!
//! let runtime = tokio::runtime::Runtime::new().expect("Failed to start runtime");
//! let config = HostConfig::load().expect("Failed to load config");
//! let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
//! let session = config.session_builder(scheduler).expect("Invalid config").build();
//!
//! let mut manager = AddonManager::new(session, Arc::new(EntryPoints::new()), &config.addons_dir);
//! manager.discover().expect("Failed to discover addons");
//! manager.load_all();
//! manager.enable_all();
//! manager.disable_all();
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod addons;
pub mod config;
pub mod logging;
pub mod version;

// Re-export main types
pub use addons::{AddonManager, AddonSession, AddonState};
pub use config::HostConfig;
pub use version::Version;
