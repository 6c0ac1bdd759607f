//! Shared fixtures for the integration tests.
//!
//! Builds real bundle archives on disk and scripted addons whose hooks are
//! supplied per test.

#![allow(dead_code, clippy::expect_used)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use addonhost::addons::audit::unit::UnitWriter;
use addonhost::addons::{
    Addon, AddonContext, AddonManager, AddonSession, EntryPoints, HookError, SharedContract, Task,
    TaskScheduler,
};

/// Shared-contract prefix used by every fixture.
pub const CONTRACT_PREFIX: &str = "engine.api";

/// Description of one bundle to write.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub id: String,
    pub version: String,
    pub entry: String,
    pub dependencies: String,
    pub optional: String,
    pub contract_level: u32,
    pub extra_units: Vec<Vec<u8>>,
    pub nested: Vec<String>,
}

impl BundleSpec {
    /// A bundle whose entry is `com.acme.<id>.Main`.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            entry: entry_symbol(id),
            dependencies: String::new(),
            optional: String::new(),
            contract_level: 1,
            extra_units: Vec::new(),
            nested: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn requires(mut self, deps: &str) -> Self {
        self.dependencies = deps.to_string();
        self
    }

    pub fn optional(mut self, deps: &str) -> Self {
        self.optional = deps.to_string();
        self
    }

    pub fn contract_level(mut self, level: u32) -> Self {
        self.contract_level = level;
        self
    }

    pub fn unit(mut self, bytes: Vec<u8>) -> Self {
        self.extra_units.push(bytes);
        self
    }

    pub fn nested(mut self, name: &str) -> Self {
        self.nested.push(name.to_string());
        self
    }

    /// `addon.toml` text for this bundle.
    pub fn descriptor(&self) -> String {
        let mut text = format!(
            "id = \"{}\"\nversion = \"{}\"\ncontract-level = {}\nentry = \"{}\"\n",
            self.id, self.version, self.contract_level, self.entry
        );
        if !self.dependencies.is_empty() {
            text.push_str(&format!("dependencies = \"{}\"\n", self.dependencies));
        }
        if !self.optional.is_empty() {
            text.push_str(&format!("optional-dependencies = \"{}\"\n", self.optional));
        }
        text
    }

    /// Writes the bundle as `<dir>/<id>.addon` and returns its path.
    pub fn write(&self, dir: &Path) -> PathBuf {
        self.write_as(dir, &format!("{}.addon", self.id))
    }

    /// Writes the bundle under an explicit file name.
    pub fn write_as(&self, dir: &Path, file_name: &str) -> PathBuf {
        let descriptor = self.descriptor();
        let entry_unit = UnitWriter::new(&self.entry).to_bytes();

        let mut entries: Vec<(String, Vec<u8>)> = vec![
            ("addon.toml".to_string(), descriptor.into_bytes()),
            (unit_path(&self.entry), entry_unit),
        ];
        for (i, unit) in self.extra_units.iter().enumerate() {
            entries.push((format!("units/extra{}.aou", i), unit.clone()));
        }
        for name in &self.nested {
            entries.push((format!("lib/{}", name), b"PK\x03\x04".to_vec()));
        }

        let path = dir.join(file_name);
        write_zip(&path, &entries);
        path
    }
}

/// Entry symbol used for a fixture id.
pub fn entry_symbol(id: &str) -> String {
    format!("com.acme.{}.Main", id.replace('-', "_"))
}

fn unit_path(symbol: &str) -> String {
    format!("units/{}.aou", symbol.replace('.', "/"))
}

/// Writes a zip archive with the given entries.
pub fn write_zip(path: &Path, entries: &[(String, Vec<u8>)]) {
    let file = File::create(path).expect("create bundle");
    let mut zip = zip::ZipWriter::new(file);
    for (name, data) in entries {
        zip.start_file(name.as_str(), SimpleFileOptions::default())
            .expect("start entry");
        zip.write_all(data).expect("write entry");
    }
    zip.finish().expect("finish bundle");
}

/// Ordered record of hook invocations across all addons.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries with the given `hook:` prefix, stripped of it.
    pub fn hooks(&self, hook: &str) -> Vec<String> {
        let prefix = format!("{}:", hook);
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

/// Hook body supplied by a test.
pub type HookFn = Arc<dyn Fn(&AddonContext) -> Result<(), HookError> + Send + Sync>;

/// An addon whose hooks journal themselves and then run optional bodies.
#[derive(Clone)]
pub struct ScriptedAddon {
    pub id: String,
    pub version: String,
    pub journal: Journal,
    pub on_load: Option<HookFn>,
    pub on_enable: Option<HookFn>,
    pub on_disable: Option<HookFn>,
}

impl ScriptedAddon {
    pub fn new(id: &str, journal: &Journal) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            journal: journal.clone(),
            on_load: None,
            on_enable: None,
            on_disable: None,
        }
    }

    pub fn reporting_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn reporting_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn on_load<F>(mut self, f: F) -> Self
    where
        F: Fn(&AddonContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_load = Some(Arc::new(f));
        self
    }

    pub fn on_enable<F>(mut self, f: F) -> Self
    where
        F: Fn(&AddonContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_enable = Some(Arc::new(f));
        self
    }

    pub fn on_disable<F>(mut self, f: F) -> Self
    where
        F: Fn(&AddonContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_disable = Some(Arc::new(f));
        self
    }

    /// Links this addon under the fixture entry symbol for `id`.
    pub fn link(self, entry_points: &EntryPoints, id: &str) {
        entry_points.register(&entry_symbol(id), move || {
            Ok(Box::new(self.clone()) as Box<dyn Addon>)
        });
    }

    fn run(&self, hook: &str, body: Option<&HookFn>, ctx: &AddonContext) -> Result<(), HookError> {
        self.journal.push(format!("{}:{}", hook, ctx.id()));
        match body {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }
}

impl Addon for ScriptedAddon {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn on_load(&mut self, ctx: &AddonContext) -> Result<(), HookError> {
        self.run("load", self.on_load.as_ref(), ctx)
    }

    fn on_enable(&mut self, ctx: &AddonContext) -> Result<(), HookError> {
        self.run("enable", self.on_enable.as_ref(), ctx)
    }

    fn on_disable(&mut self, ctx: &AddonContext) -> Result<(), HookError> {
        self.run("disable", self.on_disable.as_ref(), ctx)
    }
}

/// Scheduler that runs sync tasks inline and parks async tasks until
/// [`drain`](Self::drain) is called.
#[derive(Default)]
pub struct ManualScheduler {
    parked: Mutex<Vec<(String, Task)>>,
}

impl ManualScheduler {
    /// Number of parked background tasks.
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }

    /// Runs every parked task and returns how many ran.
    pub fn drain(&self) -> usize {
        let tasks = std::mem::take(&mut *self.parked.lock());
        let count = tasks.len();
        for (_, task) in tasks {
            task();
        }
        count
    }
}

impl TaskScheduler for ManualScheduler {
    fn run_sync(&self, _owner: &str, task: Task) {
        task();
    }

    fn run_async(&self, owner: &str, task: Task) {
        self.parked.lock().push((owner.to_string(), task));
    }
}

/// A temporary engine installation.
pub struct Harness {
    pub tmp: TempDir,
    pub addons_dir: PathBuf,
    pub data_root: PathBuf,
    pub entry_points: Arc<EntryPoints>,
    pub scheduler: Arc<ManualScheduler>,
    pub journal: Journal,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let addons_dir = tmp.path().join("addons");
        let data_root = tmp.path().join("data");
        std::fs::create_dir_all(&addons_dir).expect("addons dir");
        Self {
            tmp,
            addons_dir,
            data_root,
            entry_points: Arc::new(EntryPoints::new()),
            scheduler: Arc::new(ManualScheduler::default()),
            journal: Journal::default(),
        }
    }

    /// Writes a bundle and links a plain scripted addon for it.
    pub fn install(&self, spec: BundleSpec) {
        spec.write(&self.addons_dir);
        ScriptedAddon::new(&spec.id, &self.journal).link(&self.entry_points, &spec.id);
    }

    /// Writes a bundle and links the given addon for it.
    pub fn install_with(&self, spec: BundleSpec, addon: ScriptedAddon) {
        spec.write(&self.addons_dir);
        addon.link(&self.entry_points, &spec.id);
    }

    pub fn contract(&self) -> SharedContract {
        SharedContract::new(CONTRACT_PREFIX)
            .publish("engine.api.Storage")
            .publish("engine.api.Clock")
    }

    pub fn session(&self) -> Arc<AddonSession> {
        let scheduler: Arc<dyn TaskScheduler> = self.scheduler.clone();
        AddonSession::builder(&self.data_root, scheduler)
            .contract(self.contract())
            .build()
    }

    pub fn manager(&self) -> AddonManager {
        AddonManager::new(self.session(), Arc::clone(&self.entry_points), &self.addons_dir)
    }
}
