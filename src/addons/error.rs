//! Error taxonomy for the addon subsystem.
//!
//! Per-addon problems are recorded as [`AddonFault`] values and never
//! escape the manager's public entry points. Session-level problems are
//! returned as [`SessionError`]. Capability contract violations are
//! programming errors and are returned synchronously to the caller.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::version::VersionError;

/// Error returned by addon hooks and entry factories.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Extracts the message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lifecycle phase used for fault attribution and log scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonPhase {
    /// Instantiation and load-hook.
    Load,
    /// Enable-hook and capability materialization.
    Enable,
    /// Disable-hook and teardown.
    Disable,
    /// Anything after a successful enable.
    Runtime,
}

impl fmt::Display for AddonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddonPhase::Load => write!(f, "load"),
            AddonPhase::Enable => write!(f, "enable"),
            AddonPhase::Disable => write!(f, "disable"),
            AddonPhase::Runtime => write!(f, "runtime"),
        }
    }
}

/// A fault attributed to one addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonFault {
    /// Addon the fault belongs to.
    pub addon_id: String,
    /// Phase in which it happened.
    pub phase: AddonPhase,
    /// Whether the addon must be torn down.
    pub fatal: bool,
    /// Human-readable summary.
    pub message: String,
    /// Underlying cause, if any.
    pub cause: Option<String>,
}

impl AddonFault {
    /// Creates a fault record.
    #[must_use]
    pub fn new(
        addon_id: impl Into<String>,
        phase: AddonPhase,
        fatal: bool,
        message: impl Into<String>,
        cause: Option<String>,
    ) -> Self {
        Self {
            addon_id: addon_id.into(),
            phase,
            fatal,
            message: message.into(),
            cause,
        }
    }
}

impl fmt::Display for AddonFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.phase, self.addon_id, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

/// Invalid or missing metadata descriptor. The bundle is skipped.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The descriptor could not be parsed as a key-value table.
    #[error("malformed descriptor: {0}")]
    Malformed(String),
    /// A required key is absent or empty.
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    /// A key holds a value of the wrong shape.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// The declared version does not parse.
    #[error("invalid version: {0}")]
    Version(#[from] VersionError),
}

/// Problems reading a bundle archive.
#[derive(Debug, Error)]
pub enum BundleError {
    /// IO error while reading the archive.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The file is not a readable zip archive.
    #[error("archive error: {0}")]
    Archive(String),
    /// The archive has no `addon.toml` at its root.
    #[error("bundle has no addon.toml descriptor")]
    NoDescriptor,
    /// The archive exceeds the entry count or entry size bound.
    #[error("bundle exceeds limits: {0}")]
    TooLarge(String),
    /// The descriptor is invalid.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Violations of the per-addon data directory sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The addon id cannot be mapped to a safe directory name.
    #[error("addon id '{id}' is not a safe directory name: {reason}")]
    UnsafeName {
        /// Offending id.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// Another addon id already owns the normalized directory name.
    #[error("addon id '{id}' maps to data folder '{name}', already owned by '{owner}'")]
    NameTaken {
        /// Requesting id.
        id: String,
        /// Normalized directory name.
        name: String,
        /// Id that claimed the name first.
        owner: String,
    },
    /// A path component is a symbolic link.
    #[error("path component {0} is a symbolic link")]
    Symlink(PathBuf),
    /// A path exists but is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    /// The directory is not readable or writable.
    #[error("{path} is not accessible: {reason}")]
    Permission {
        /// Path checked.
        path: PathBuf,
        /// What failed.
        reason: String,
    },
    /// The resolved real path escaped the managed root.
    #[error("{path} escapes the data root {root}")]
    Escape {
        /// Resolved path.
        path: PathBuf,
        /// Real path of the root.
        root: PathBuf,
    },
    /// The root has not been provisioned yet.
    #[error("data root has not been provisioned")]
    RootNotReady,
    /// Other IO failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// Misuse of the capability surface. Signals a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityContractError {
    /// The capability symbol is outside the shared-contract namespace.
    #[error("capability '{symbol}' is not part of the shared contract")]
    NotShared {
        /// Offending symbol.
        symbol: String,
    },
    /// The capability is already owned by another addon.
    #[error("capability '{symbol}' is already owned by '{owner}', rejected for '{requester}'")]
    AlreadyOwned {
        /// Capability symbol.
        symbol: String,
        /// Current owner.
        owner: String,
        /// Addon that attempted the registration.
        requester: String,
    },
    /// The host's service directory refused the exposure.
    #[error("exposure of '{symbol}' refused: {reason}")]
    ExposureRefused {
        /// Capability symbol.
        symbol: String,
        /// Reason reported by the directory.
        reason: String,
    },
}

/// Extension-point keys must be prefixed by the addon's own namespace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionKeyError {
    /// The key lacks the `<namespace>:` prefix.
    #[error("extension key '{key}' must start with '{expected}:'")]
    WrongNamespace {
        /// Offending key.
        key: String,
        /// Namespace the addon owns.
        expected: String,
    },
    /// The key has nothing after the prefix.
    #[error("extension key '{0}' has an empty name")]
    EmptyName(String),
    /// The key is already registered at that extension point.
    #[error("extension key '{key}' is already registered at '{point}'")]
    Duplicate {
        /// Extension point.
        point: String,
        /// Offending key.
        key: String,
    },
}

/// Errors surfaced by the host's service directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The owner is not enabled and may not expose services.
    #[error("owner '{0}' is not enabled")]
    OwnerNotEnabled(String),
    /// The directory rejected the registration for another reason.
    #[error("{0}")]
    Rejected(String),
}

/// Session-level failures that abort the whole subsystem.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The managed data root cannot be created or accessed.
    #[error("cannot provision data root: {0}")]
    DataRoot(#[from] SandboxError),
    /// The bundle directory cannot be listed.
    #[error("cannot read bundle directory {path}: {source}")]
    BundleDirectory {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display_includes_cause() {
        let fault = AddonFault::new(
            "storage",
            AddonPhase::Enable,
            true,
            "enable hook failed",
            Some("disk full".to_string()),
        );
        assert_eq!(
            fault.to_string(),
            "[enable] storage: enable hook failed (caused by: disk full)"
        );
    }

    #[test]
    fn test_capability_error_messages() {
        let err = CapabilityContractError::AlreadyOwned {
            symbol: "engine.api.Storage".to_string(),
            owner: "a".to_string(),
            requester: "b".to_string(),
        };
        assert!(err.to_string().contains("already owned by 'a'"));
    }
}
