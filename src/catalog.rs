use crate::{
    config::LibraryConfig,
    fs_cache::FileSystemCache,
    model::{order_categories, ModelFileRef, SubfolderFilter},
};
use log::{debug, info, warn};
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use tokio_util::sync::CancellationToken;

/// Walks every category under the library root and returns the deduplicated
/// model list, or `None` if `cancel` fired before the walk finished.
pub fn scan(
    config: &LibraryConfig,
    cache: &FileSystemCache,
    categories: &[String],
    cancel: &CancellationToken,
) -> Option<Vec<ModelFileRef>> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();

    for category in categories {
        let path = config.root.join(category);
        if !walk(config, cache, &path, category, &mut visited, &mut found, cancel) {
            debug!("Scan cancelled while walking {category}");
            return None;
        }
    }

    let unique: BTreeSet<ModelFileRef> = found.into_iter().collect();
    Some(unique.into_iter().collect())
}

fn walk(
    config: &LibraryConfig,
    cache: &FileSystemCache,
    dir: &Path,
    relative: &str,
    visited: &mut HashSet<PathBuf>,
    found: &mut Vec<ModelFileRef>,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }

    let identity = match fs::canonicalize(dir) {
        Ok(path) => path,
        Err(err) => {
            warn!("Skipping unreadable directory {:?}: {err}", dir);
            return true;
        }
    };
    if !visited.insert(identity) {
        debug!("Already visited {:?}; skipping", dir);
        return true;
    }

    for name in cache.get_dir_content(dir).iter() {
        let child = dir.join(name);
        if cache.get_file_info(&child).is_dir {
            let child_relative = format!("{relative}/{name}");
            if !walk(config, cache, &child, &child_relative, visited, found, cancel) {
                return false;
            }
        } else if config.is_model_file(name) {
            found.push(ModelFileRef::new(name.clone(), relative));
        }
    }
    true
}

fn contains_models(config: &LibraryConfig, cache: &FileSystemCache, dir: &Path) -> bool {
    let mut visited = HashSet::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(identity) = fs::canonicalize(&current) else {
            continue;
        };
        if !visited.insert(identity) {
            continue;
        }
        for name in cache.get_dir_content(&current).iter() {
            let child = current.join(name);
            if cache.get_file_info(&child).is_dir {
                pending.push(child);
            } else if config.is_model_file(name) {
                return true;
            }
        }
    }
    false
}

#[derive(Debug)]
pub struct CatalogService {
    config: Arc<LibraryConfig>,
    cache: Arc<FileSystemCache>,
    categories: RwLock<Vec<String>>,
    catalog: RwLock<Vec<ModelFileRef>>,
}

impl CatalogService {
    pub fn new(config: Arc<LibraryConfig>) -> Self {
        let cache = Arc::new(FileSystemCache::new(config.cache_lifetime));
        Self {
            config,
            cache,
            categories: RwLock::new(Vec::new()),
            catalog: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn cache(&self) -> &FileSystemCache {
        &self.cache
    }

    pub fn discover_categories(&self) -> Vec<String> {
        let root = &self.config.root;
        let candidates = self
            .cache
            .get_dir_content(root)
            .iter()
            .filter(|name| !self.config.is_ignored_dir(name))
            .filter(|name| self.cache.get_file_info(&root.join(name)).is_dir)
            .filter(|name| contains_models(&self.config, &self.cache, &root.join(name)))
            .cloned()
            .collect();
        order_categories(candidates)
    }

    /// Drops cached listings, rediscovers categories and rescans. The stored
    /// catalog is only replaced when the scan ran to completion.
    pub fn refresh(&self, cancel: &CancellationToken) -> Option<usize> {
        self.cache.clear();
        let categories = self.discover_categories();
        let files = scan(&self.config, &self.cache, &categories, cancel)?;
        let count = files.len();
        info!(
            "Scanned {} models across {} categories under {:?}",
            count,
            categories.len(),
            self.config.root
        );
        *self.categories.write().expect("categories poisoned") = categories;
        *self.catalog.write().expect("catalog poisoned") = files;
        Some(count)
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.read().expect("categories poisoned").clone()
    }

    pub fn catalog_snapshot(&self) -> Vec<ModelFileRef> {
        self.catalog.read().expect("catalog poisoned").clone()
    }

    pub fn find(&self, key: &str) -> Option<ModelFileRef> {
        let wanted = ModelFileRef::from_key(key)?;
        self.catalog
            .read()
            .expect("catalog poisoned")
            .iter()
            .find(|model| **model == wanted)
            .cloned()
    }

    pub fn subfolders(&self, category: &str) -> Vec<String> {
        let category_path = self.config.root.join(category);
        let mut names: BTreeSet<String> = self
            .cache
            .get_dir_content(&category_path)
            .iter()
            .filter(|name| self.cache.get_file_info(&category_path.join(name)).is_dir)
            .cloned()
            .collect();
        names.insert(SubfolderFilter::OTHER_TOKEN.to_string());
        names.insert(SubfolderFilter::FAVORITES_TOKEN.to_string());
        names.into_iter().collect()
    }

    pub fn model_path(&self, model: &ModelFileRef) -> PathBuf {
        model.absolute_path(&self.config.root)
    }

    pub fn apply_change(&self, removed: Option<&ModelFileRef>, added: Option<ModelFileRef>) {
        let mut catalog = self.catalog.write().expect("catalog poisoned");
        if let Some(removed) = removed {
            catalog.retain(|model| model != removed);
        }
        if let Some(added) = added {
            if !catalog.contains(&added) {
                catalog.push(added);
                catalog.sort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn library(root: &Path) -> CatalogService {
        let config = LibraryConfig::new(root).with_cache_lifetime(Duration::from_secs(60));
        CatalogService::new(Arc::new(config))
    }

    #[test]
    fn scan_collects_models_recursively() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "checkpoints/a.safetensors");
        touch(dir.path(), "checkpoints/sub/deep/b.ckpt");
        touch(dir.path(), "checkpoints/a.png");
        touch(dir.path(), "checkpoints/notes.txt");
        touch(dir.path(), "loras/c.pt");

        let service = library(dir.path());
        assert_eq!(service.refresh(&CancellationToken::new()), Some(3));

        let keys: Vec<String> = service
            .catalog_snapshot()
            .iter()
            .map(ModelFileRef::key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "checkpoints/a.safetensors",
                "checkpoints/sub/deep/b.ckpt",
                "loras/c.pt"
            ]
        );
    }

    #[test]
    fn categories_skip_empty_and_ignored_folders() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vae/v.safetensors");
        touch(dir.path(), "loras/nested/l.safetensors");
        touch(dir.path(), "checkpoints/c.ckpt");
        touch(dir.path(), "ui/u.safetensors");
        touch(dir.path(), "docs/readme.md");

        let service = library(dir.path());
        assert_eq!(
            service.discover_categories(),
            vec!["checkpoints", "loras", "vae"]
        );
    }

    #[test]
    fn subfolders_include_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "loras/style/a.pt");
        touch(dir.path(), "loras/char/b.pt");
        touch(dir.path(), "loras/c.pt");

        let service = library(dir.path());
        assert_eq!(
            service.subfolders("loras"),
            vec!["char", "style", "其他", "收藏"]
        );
    }

    #[test]
    fn cancelled_scan_returns_none_and_keeps_previous_catalog() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "loras/a.pt");
        let service = library(dir.path());
        service.refresh(&CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(service.refresh(&cancel), None);
        assert_eq!(service.catalog_snapshot().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_are_visited_once() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "loras/a.pt");
        std::os::unix::fs::symlink(dir.path().join("loras"), dir.path().join("loras/loop"))
            .unwrap();

        let service = library(dir.path());
        let files = scan(
            service.config(),
            service.cache(),
            &["loras".to_string()],
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(files, vec![ModelFileRef::new("a.pt", "loras")]);
    }

    #[test]
    fn duplicate_walk_paths_yield_unique_keys() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "loras/a.pt");
        let service = library(dir.path());

        let files = scan(
            service.config(),
            service.cache(),
            &["loras".to_string(), "loras".to_string()],
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn apply_change_updates_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "loras/a.pt");
        let service = library(dir.path());
        service.refresh(&CancellationToken::new()).unwrap();

        let old = ModelFileRef::new("a.pt", "loras");
        let new = ModelFileRef::new("a.pt", "loras/style");
        service.apply_change(Some(&old), Some(new.clone()));
        assert_eq!(service.catalog_snapshot(), vec![new.clone()]);
        assert_eq!(service.find("loras/style/a.pt"), Some(new));
    }
}
