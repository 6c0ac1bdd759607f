//! Addon bundle archives.
//!
//! A bundle is a zip archive holding an `addon.toml` descriptor, compiled
//! units (`*.aou`) and possibly nested libraries. Bundles are read fully
//! into memory under fixed bounds.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::error::BundleError;
use super::metadata::{DESCRIPTOR_NAME, Descriptor};

/// File extensions recognized as bundles in the bundle directory.
pub const BUNDLE_EXTENSIONS: &[&str] = &["addon", "zip"];

/// Extension of compiled unit entries.
pub const UNIT_EXTENSION: &str = "aou";

/// Entry extensions treated as nested bundled libraries.
pub const NESTED_LIBRARY_EXTENSIONS: &[&str] = &["addon", "zip", "jar"];

/// Maximum entries per bundle.
const MAX_ENTRIES: usize = 4096;

/// Maximum uncompressed size of a single entry (8 MiB).
const MAX_ENTRY_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum number of files considered in the bundle directory.
const MAX_BUNDLES: usize = 1024;

/// A compiled unit read from a bundle.
#[derive(Debug, Clone)]
pub struct UnitEntry {
    /// Entry path inside the archive.
    pub name: String,
    /// Raw unit bytes.
    pub bytes: Vec<u8>,
}

/// An opened bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Path of the archive.
    pub path: PathBuf,
    /// File name, used for ordering and reporting.
    pub file_name: String,
    /// Parsed descriptor.
    pub descriptor: Descriptor,
    /// Compiled units in archive order.
    pub units: Vec<UnitEntry>,
    /// Entry names of nested libraries.
    pub nested_libraries: Vec<String>,
}

impl Bundle {
    /// Returns true if `path` has a bundle extension.
    #[must_use]
    pub fn is_bundle_path(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                BUNDLE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
    }

    /// Lists bundle files in `dir` in lexicographic file-name order.
    ///
    /// Directories and files without a bundle extension are ignored.
    pub fn list(dir: &Path) -> io::Result<Vec<PathBuf>> {
        Self::list_limited(dir, MAX_BUNDLES)
    }

    /// Keeps the first `limit` bundles by name, whatever order the
    /// directory yields them in.
    fn list_limited(dir: &Path, limit: usize) -> io::Result<Vec<PathBuf>> {
        let mut bundles: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_bundle_path(path))
            .collect();
        bundles.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        if bundles.len() > limit {
            tracing::warn!(
                "Bundle directory {} holds {} bundles, ignoring all after the first {}",
                dir.display(),
                bundles.len(),
                limit
            );
            bundles.truncate(limit);
        }
        Ok(bundles)
    }

    /// Opens and reads a bundle archive.
    pub fn open(path: &Path) -> Result<Self, BundleError> {
        let file = File::open(path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| BundleError::Archive(e.to_string()))?;

        if archive.len() > MAX_ENTRIES {
            return Err(BundleError::TooLarge(format!(
                "{} entries (max {})",
                archive.len(),
                MAX_ENTRIES
            )));
        }

        let mut descriptor = None;
        let mut units = Vec::new();
        let mut nested_libraries = Vec::new();

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| BundleError::Archive(format!("entry {}: {}", i, e)))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();

            if name == DESCRIPTOR_NAME {
                let bytes = read_bounded(&mut entry, &name)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| BundleError::Archive("addon.toml is not UTF-8".to_string()))?;
                descriptor = Some(Descriptor::parse(&text)?);
            } else if has_extension(&name, &[UNIT_EXTENSION]) {
                let bytes = read_bounded(&mut entry, &name)?;
                units.push(UnitEntry { name, bytes });
            } else if has_extension(&name, NESTED_LIBRARY_EXTENSIONS) {
                nested_libraries.push(name);
            }
        }

        let descriptor = descriptor.ok_or(BundleError::NoDescriptor)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            descriptor,
            units,
            nested_libraries,
        })
    }
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

fn read_bounded(reader: &mut impl Read, name: &str) -> Result<Vec<u8>, BundleError> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_ENTRY_SIZE + 1)
        .read_to_end(&mut bytes)?;
    if bytes.len() as u64 > MAX_ENTRY_SIZE {
        return Err(BundleError::TooLarge(format!(
            "entry '{}' exceeds {} bytes",
            name, MAX_ENTRY_SIZE
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("create zip");
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default())
                .expect("start file");
            zip.write_all(data).expect("write entry");
        }
        zip.finish().expect("finish zip");
    }

    const DESCRIPTOR: &[u8] =
        b"id = \"a\"\nversion = \"1.0.0\"\ncontract-level = 1\nentry = \"a.Main\"\n";

    #[test]
    fn test_open_classifies_entries() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("a.addon");
        write_zip(
            &path,
            &[
                ("addon.toml", DESCRIPTOR),
                ("units/a/Main.aou", b"\xA0\xD0\xC0\xDE"),
                ("lib/shaded.jar", b"PK"),
                ("README.md", b"ignored"),
            ],
        );

        let bundle = Bundle::open(&path).expect("open bundle");
        assert_eq!(bundle.file_name, "a.addon");
        assert_eq!(bundle.descriptor.get("id"), Some("a"));
        assert_eq!(bundle.units.len(), 1);
        assert_eq!(bundle.units[0].name, "units/a/Main.aou");
        assert_eq!(bundle.nested_libraries, vec!["lib/shaded.jar".to_string()]);
    }

    #[test]
    fn test_open_without_descriptor() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("empty.addon");
        write_zip(&path, &[("units/x.aou", b"")]);
        assert!(matches!(Bundle::open(&path), Err(BundleError::NoDescriptor)));
    }

    #[test]
    fn test_open_rejects_non_archive() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("broken.addon");
        fs::write(&path, b"definitely not a zip").expect("write");
        assert!(matches!(Bundle::open(&path), Err(BundleError::Archive(_))));
    }

    #[test]
    fn test_list_sorts_and_filters() {
        let dir = TempDir::new().expect("temp dir");
        for name in ["b.addon", "a.zip", "notes.txt", "c.ADDON"] {
            fs::write(dir.path().join(name), b"").expect("write");
        }
        fs::create_dir(dir.path().join("d.addon")).expect("mkdir");

        let names: Vec<String> = Bundle::list(dir.path())
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["a.zip", "b.addon", "c.ADDON"]);
    }

    #[test]
    fn test_cap_keeps_the_first_names() {
        let dir = TempDir::new().expect("temp dir");
        for name in ["e.addon", "a.addon", "d.addon", "b.addon", "c.addon"] {
            fs::write(dir.path().join(name), b"").expect("write");
        }

        let names: Vec<String> = Bundle::list_limited(dir.path(), 3)
            .expect("list")
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["a.addon", "b.addon", "c.addon"]);
    }
}
