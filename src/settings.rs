use std::fmt::Debug;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::data::{DataStore, FsStore, MemoryStore};
use crate::error::ShioriError;
use crate::filter::FilterRegistry;
use crate::tree::{DEFAULT_EXCLUDE, FileTree, FsTree};

/// Project level configuration.
///
/// Every field has a default, so an empty JSON object is a valid settings
/// file. Relative paths are resolved against `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Project root, the directory pattern documents are matched against.
    pub root: Utf8PathBuf,
    /// Location of the content store.
    pub cache_dir: Utf8PathBuf,
    /// Path of the run history database.
    pub history: Utf8PathBuf,
    /// Parent directory for per-filter working areas, the system temp
    /// directory when unset.
    pub scratch_dir: Option<Utf8PathBuf>,
    /// Size of the worker pool, rayon's default when unset.
    pub workers: Option<usize>,
    /// Directory names skipped while walking the project tree.
    pub exclude: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            cache_dir: Utf8PathBuf::from(".shiori/cache"),
            history: Utf8PathBuf::from(".shiori/history.sqlite3"),
            scratch_dir: None,
            workers: None,
            exclude: DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ShioriError> {
        let path = path.as_ref();
        Self::read(path).map_err(|e| ShioriError::Settings(path.to_string(), e))
    }

    fn read(path: &Utf8Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).context("Couldn't read file")?;
        let settings = serde_json::from_str(&text).context("Couldn't parse JSON")?;
        Ok(settings)
    }

    pub fn with_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_history(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.history = path.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        match path.is_absolute() {
            true => path.to_owned(),
            false => self.root.join(path),
        }
    }

    pub fn cache_path(&self) -> Utf8PathBuf {
        self.resolve(&self.cache_dir)
    }

    pub fn history_path(&self) -> Utf8PathBuf {
        self.resolve(&self.history)
    }

    pub fn scratch_path(&self) -> Option<Utf8PathBuf> {
        self.scratch_dir.as_deref().map(|dir| self.resolve(dir))
    }
}

/// Collaborators shared by every task of a batch.
#[derive(Clone)]
pub struct Environment {
    pub settings: Settings,
    pub filters: FilterRegistry,
    pub tree: Arc<dyn FileTree>,
    pub store: Arc<dyn DataStore>,
}

impl Environment {
    /// Environment backed by the file system: the project tree under
    /// `settings.root` and a content store under `settings.cache_dir`.
    pub fn new(settings: Settings, filters: FilterRegistry) -> Self {
        let tree = FsTree::new(settings.root.clone()).with_exclude(settings.exclude.clone());
        let store = FsStore::new(settings.cache_path());

        Self {
            settings,
            filters,
            tree: Arc::new(tree),
            store: Arc::new(store),
        }
    }

    /// Environment over an arbitrary tree, with outputs kept in memory.
    pub fn in_memory(filters: FilterRegistry, tree: impl FileTree + 'static) -> Self {
        Self {
            settings: Settings::default(),
            filters,
            tree: Arc::new(tree),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

impl Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .field("filters", &self.filters)
            .field("store", &self.store.storage_type())
            .finish()
    }
}
