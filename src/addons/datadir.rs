//! Sandboxed per-addon data directories.
//!
//! Every addon gets exactly one directory directly under the managed data
//! root. Names are normalized and validated before the filesystem is
//! touched; symlinks are refused at every segment, and the final real
//! path must stay inside the root's real path.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::error::SandboxError;
use crate::logging::LOG_DIR_NAME;

/// Maximum length of a normalized directory name.
const MAX_NAME_LEN: usize = 128;

/// Names under the root that belong to the host, not to any addon.
const RESERVED_NAMES: &[&str] = &[LOG_DIR_NAME];

/// Maps an addon id to its directory name.
///
/// Lowercases, maps `:` to `-` and requires `[a-z0-9][a-z0-9_-]*`.
/// Traversal tokens and separators are rejected outright.
pub fn safe_dir_name(id: &str) -> Result<String, SandboxError> {
    let unsafe_name = |reason| SandboxError::UnsafeName {
        id: id.to_string(),
        reason,
    };

    if id.is_empty() {
        return Err(unsafe_name("empty id"));
    }
    if id.contains("..") || id.contains(['/', '\\', '\0']) {
        return Err(unsafe_name("contains a traversal token or path separator"));
    }

    let name: String = id
        .chars()
        .map(|c| if c == ':' { '-' } else { c.to_ascii_lowercase() })
        .collect();

    if name.len() > MAX_NAME_LEN {
        return Err(unsafe_name("name too long"));
    }
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid_first || !valid_rest {
        return Err(unsafe_name("must match [a-z0-9][a-z0-9_-]*"));
    }
    Ok(name)
}

/// Provisions the data root and per-addon folders below it.
#[derive(Debug)]
pub struct AddonDataDirectorySystem {
    root: PathBuf,
    real_root: Mutex<Option<PathBuf>>,
    /// Directory name to the id that claimed it.
    claims: Mutex<BTreeMap<String, String>>,
}

impl AddonDataDirectorySystem {
    /// Creates a system managing `root`. Nothing is touched yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            real_root: Mutex::new(None),
            claims: Mutex::new(BTreeMap::new()),
        }
    }

    /// Configured root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root if absent and verifies it.
    ///
    /// The root must be a real directory (not a symlink), readable and
    /// writable. Returns its canonical path.
    pub fn ensure_root_directory(&self) -> Result<PathBuf, SandboxError> {
        match fs::symlink_metadata(&self.root) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.root).map_err(|source| SandboxError::Io {
                    path: self.root.clone(),
                    source,
                })?;
                tracing::info!("Created addon data root {}", self.root.display());
            }
            Err(source) => {
                return Err(SandboxError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        }

        check_real_directory(&self.root)?;
        fs::read_dir(&self.root).map_err(|e| SandboxError::Permission {
            path: self.root.clone(),
            reason: format!("not readable: {}", e),
        })?;
        probe_writable(&self.root)?;

        let real = fs::canonicalize(&self.root).map_err(|source| SandboxError::Io {
            path: self.root.clone(),
            source,
        })?;
        *self.real_root.lock() = Some(real.clone());
        Ok(real)
    }

    /// Provisions the data folder for `id` and returns its real path.
    ///
    /// Requires [`ensure_root_directory`](Self::ensure_root_directory)
    /// to have succeeded. Calling it again for the same id returns the same
    /// directory. A name is bound to the first id that maps to it; another
    /// id normalizing to the same name is refused, as are host-reserved names.
    pub fn ensure_addon_data_folder(&self, id: &str) -> Result<PathBuf, SandboxError> {
        let name = safe_dir_name(id)?;
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(SandboxError::UnsafeName {
                id: id.to_string(),
                reason: "reserved for the host",
            });
        }
        if let Some(owner) = self.claims.lock().get(&name).filter(|owner| *owner != id) {
            return Err(SandboxError::NameTaken {
                id: id.to_string(),
                name,
                owner: owner.clone(),
            });
        }
        let real_root = self
            .real_root
            .lock()
            .clone()
            .ok_or(SandboxError::RootNotReady)?;

        // The root itself may have been swapped since it was provisioned.
        check_real_directory(&real_root)?;

        let mut path = real_root.clone();
        for segment in Path::new(&name).components() {
            path.push(segment);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(SandboxError::Symlink(path));
                }
                Ok(meta) if !meta.is_dir() => return Err(SandboxError::NotADirectory(path)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    match fs::create_dir(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                        Err(source) => return Err(SandboxError::Io { path, source }),
                    }
                    check_real_directory(&path)?;
                }
                Err(source) => return Err(SandboxError::Io { path, source }),
            }
        }

        probe_writable(&path)?;

        let real = fs::canonicalize(&path).map_err(|source| SandboxError::Io {
            path: path.clone(),
            source,
        })?;
        if !real.starts_with(&real_root) || real == real_root {
            return Err(SandboxError::Escape {
                path: real,
                root: real_root,
            });
        }

        let mut claims = self.claims.lock();
        match claims.get(&name) {
            Some(owner) if owner != id => {
                return Err(SandboxError::NameTaken {
                    id: id.to_string(),
                    name,
                    owner: owner.clone(),
                });
            }
            Some(_) => {}
            None => {
                claims.insert(name, id.to_string());
            }
        }
        drop(claims);

        tracing::debug!(addon = id, "Data folder ready at {}", real.display());
        Ok(real)
    }
}

fn check_real_directory(path: &Path) -> Result<(), SandboxError> {
    let meta = fs::symlink_metadata(path).map_err(|source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.file_type().is_symlink() {
        return Err(SandboxError::Symlink(path.to_path_buf()));
    }
    if !meta.is_dir() {
        return Err(SandboxError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

/// Writes and removes a uniquely named probe file.
fn probe_writable(dir: &Path) -> Result<(), SandboxError> {
    let probe = dir.join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
    let result = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .and_then(|mut file| file.write_all(b"probe"));
    let _ = fs::remove_file(&probe);
    result.map_err(|e| SandboxError::Permission {
        path: dir.to_path_buf(),
        reason: format!("not writable: {}", e),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_dir_name_normalization() {
        assert_eq!(safe_dir_name("Foo:Bar").expect("name"), "foo-bar");
        assert_eq!(safe_dir_name("logging_2").expect("name"), "logging_2");
    }

    #[test]
    fn test_safe_dir_name_rejections() {
        for id in ["", "..", "a/../b", "a/b", "a\\b", "nul\0", "-lead", "_lead", "has space", "dot.ted"] {
            assert!(
                matches!(safe_dir_name(id), Err(SandboxError::UnsafeName { .. })),
                "accepted {:?}",
                id
            );
        }
    }

    #[test]
    fn test_folder_requires_root() {
        let tmp = TempDir::new().expect("tempdir");
        let system = AddonDataDirectorySystem::new(tmp.path().join("data"));
        assert!(matches!(
            system.ensure_addon_data_folder("foo"),
            Err(SandboxError::RootNotReady)
        ));
    }

    #[test]
    fn test_traversal_rejected_before_filesystem_access() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("data");
        let system = AddonDataDirectorySystem::new(&root);

        // Root was never created, so any filesystem access would error
        // with RootNotReady instead.
        assert!(matches!(
            system.ensure_addon_data_folder("../escape"),
            Err(SandboxError::UnsafeName { .. })
        ));
        assert!(!root.exists());
    }

    #[test]
    fn test_provisions_normalized_folder_under_root() {
        let tmp = TempDir::new().expect("tempdir");
        let system = AddonDataDirectorySystem::new(tmp.path().join("data"));
        let real_root = system.ensure_root_directory().expect("root");

        let dir = system.ensure_addon_data_folder("foo:bar").expect("folder");
        assert!(dir.is_dir());
        assert_eq!(dir.parent(), Some(real_root.as_path()));
        assert_eq!(dir.file_name().and_then(|n| n.to_str()), Some("foo-bar"));

        let again = system.ensure_addon_data_folder("foo:bar").expect("folder");
        assert_eq!(dir, again);
        assert_eq!(fs::read_dir(&dir).expect("read").count(), 0);
    }

    #[test]
    fn test_distinct_ids_never_share_a_folder() {
        let tmp = TempDir::new().expect("tempdir");
        let system = AddonDataDirectorySystem::new(tmp.path().join("data"));
        system.ensure_root_directory().expect("root");

        system.ensure_addon_data_folder("storage").expect("folder");
        system.ensure_addon_data_folder("acme:ui").expect("folder");

        for (id, owner) in [("Storage", "storage"), ("acme-ui", "acme:ui"), ("ACME:UI", "acme:ui")] {
            match system.ensure_addon_data_folder(id) {
                Err(SandboxError::NameTaken { owner: taken_by, .. }) => assert_eq!(taken_by, owner),
                other => panic!("{} was not refused: {:?}", id, other),
            }
        }
        assert!(system.ensure_addon_data_folder("storage").is_ok());
    }

    #[test]
    fn test_log_directory_name_is_reserved() {
        let tmp = TempDir::new().expect("tempdir");
        let system = AddonDataDirectorySystem::new(tmp.path().join("data"));
        let root = system.ensure_root_directory().expect("root");

        for id in ["logs", "Logs"] {
            assert!(matches!(
                system.ensure_addon_data_folder(id),
                Err(SandboxError::UnsafeName { .. })
            ));
        }
        assert!(!root.join("logs").exists());
    }

    #[test]
    fn test_root_must_be_directory() {
        let tmp = TempDir::new().expect("tempdir");
        let file = tmp.path().join("file");
        fs::write(&file, b"x").expect("write");
        let system = AddonDataDirectorySystem::new(&file);
        assert!(matches!(
            system.ensure_root_directory(),
            Err(SandboxError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_root_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let target = tmp.path().join("target");
        fs::create_dir(&target).expect("mkdir");
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        let system = AddonDataDirectorySystem::new(&link);
        assert!(matches!(
            system.ensure_root_directory(),
            Err(SandboxError::Symlink(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_addon_folder_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).expect("mkdir");
        let system = AddonDataDirectorySystem::new(tmp.path().join("data"));
        let root = system.ensure_root_directory().expect("root");
        std::os::unix::fs::symlink(&outside, root.join("evil")).expect("symlink");

        assert!(matches!(
            system.ensure_addon_data_folder("evil"),
            Err(SandboxError::Symlink(_))
        ));
    }
}
