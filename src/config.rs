use crate::{
    env_flags,
    model::{MODEL_EXTENSIONS, PREVIEW_EXTENSIONS},
    store::MetadataStore,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

pub const INFO_FILE: &str = "model_info.json";
pub const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_secs(300);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the catalog, store and scrapers need to know about one library.
/// Passed explicitly so several libraries can coexist in one process.
#[derive(Clone, Debug)]
pub struct LibraryConfig {
    pub root: PathBuf,
    pub info_file: PathBuf,
    pub cache_lifetime: Duration,
    pub http_timeout: Duration,
    pub model_extensions: Vec<String>,
    pub preview_extensions: Vec<String>,
    pub ignored_dirs: Vec<String>,
    pub offline: bool,
    pub keep_backup: bool,
}

impl LibraryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let info_file = root.join(INFO_FILE);
        Self {
            root,
            info_file,
            cache_lifetime: DEFAULT_CACHE_LIFETIME,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            model_extensions: MODEL_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            preview_extensions: PREVIEW_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            ignored_dirs: vec!["ui".to_string()],
            offline: false,
            keep_backup: false,
        }
    }

    pub fn from_env() -> Result<Self> {
        let root = match env_flags::library_root_override() {
            Some(root) => root,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        let mut config = Self::new(root);
        if let Some(info_file) = env_flags::info_file_override() {
            config.info_file = info_file;
        }
        config.offline = env_flags::offline_mode();
        config.keep_backup = env_flags::keep_metadata_backup();
        Ok(config)
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if self.info_file == self.root.join(INFO_FILE) {
            self.info_file = root.join(INFO_FILE);
        }
        self.root = root;
        self
    }

    pub fn with_info_file(mut self, info_file: impl Into<PathBuf>) -> Self {
        self.info_file = info_file.into();
        self
    }

    pub fn with_cache_lifetime(mut self, lifetime: Duration) -> Self {
        self.cache_lifetime = lifetime;
        self
    }

    pub fn is_model_file(&self, name: &str) -> bool {
        self.model_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    pub fn is_ignored_dir(&self, name: &str) -> bool {
        self.ignored_dirs.iter().any(|ignored| ignored == name)
    }

    pub fn relative_to_root(&self, path: &Path) -> Option<PathBuf> {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        path.strip_prefix(&root)
            .ok()
            .filter(|relative| !relative.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AppSettings {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default = "default_font_size_mode")]
    pub font_size_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            font_family: None,
            font_size_mode: default_font_size_mode(),
            sort: None,
            extra: serde_json::Map::new(),
        }
    }
}

fn default_theme() -> String {
    "darkly".to_string()
}

fn default_font_size_mode() -> String {
    "small".to_string()
}

#[derive(Debug)]
pub struct ConfigStore {
    store: Arc<MetadataStore>,
    settings: RwLock<AppSettings>,
}

impl ConfigStore {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        let settings = store.app_settings();
        Self {
            store,
            settings: RwLock::new(settings),
        }
    }

    pub fn settings(&self) -> AppSettings {
        self.settings
            .read()
            .expect("settings lock poisoned")
            .clone()
    }

    pub fn update_settings<F>(&self, mutate: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut guard = self
            .settings
            .write()
            .expect("settings lock poisoned for write");
        mutate(&mut guard);
        let snapshot = guard.clone();
        self.store.save_app_settings(&snapshot)?;
        Ok(snapshot)
    }
}
