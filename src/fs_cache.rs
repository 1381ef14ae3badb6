use log::debug;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{Duration, Instant, UNIX_EPOCH},
};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FileInfo {
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
    pub exists: bool,
    pub is_dir: bool,
}

impl FileInfo {
    pub const ABSENT: FileInfo = FileInfo {
        size: 0,
        mtime: 0.0,
        exists: false,
        is_dir: false,
    };
}

#[derive(Debug)]
struct Entry<T> {
    stored_at: Instant,
    value: T,
}

#[derive(Debug)]
pub struct FileSystemCache {
    lifetime: Duration,
    files: RwLock<HashMap<PathBuf, Entry<FileInfo>>>,
    dirs: RwLock<HashMap<PathBuf, Entry<Arc<Vec<String>>>>>,
}

impl FileSystemCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn get_file_info(&self, path: &Path) -> FileInfo {
        if let Some(entry) = self
            .files
            .read()
            .expect("file cache poisoned")
            .get(path)
            .filter(|entry| entry.stored_at.elapsed() < self.lifetime)
        {
            return entry.value;
        }

        match stat(path) {
            Some(info) => {
                self.files.write().expect("file cache poisoned").insert(
                    path.to_path_buf(),
                    Entry {
                        stored_at: Instant::now(),
                        value: info,
                    },
                );
                info
            }
            None => FileInfo::ABSENT,
        }
    }

    /// Entry names of `path`, sorted so repeated scans visit children in the
    /// same order.
    pub fn get_dir_content(&self, path: &Path) -> Arc<Vec<String>> {
        if let Some(entry) = self
            .dirs
            .read()
            .expect("dir cache poisoned")
            .get(path)
            .filter(|entry| entry.stored_at.elapsed() < self.lifetime)
        {
            return Arc::clone(&entry.value);
        }

        match list_dir(path) {
            Some(names) => {
                let names = Arc::new(names);
                self.dirs.write().expect("dir cache poisoned").insert(
                    path.to_path_buf(),
                    Entry {
                        stored_at: Instant::now(),
                        value: Arc::clone(&names),
                    },
                );
                names
            }
            None => Arc::new(Vec::new()),
        }
    }

    pub fn clear(&self) {
        self.files.write().expect("file cache poisoned").clear();
        self.dirs.write().expect("dir cache poisoned").clear();
    }

    pub fn invalidate(&self, path: &Path) {
        self.files.write().expect("file cache poisoned").remove(path);
        self.dirs.write().expect("dir cache poisoned").remove(path);
        if let Some(parent) = path.parent() {
            self.dirs.write().expect("dir cache poisoned").remove(parent);
        }
    }
}

impl Default for FileSystemCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CACHE_LIFETIME)
    }
}

fn stat(path: &Path) -> Option<FileInfo> {
    match fs::metadata(path) {
        Ok(metadata) => {
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0);
            Some(FileInfo {
                size: metadata.len(),
                mtime,
                exists: true,
                is_dir: metadata.is_dir(),
            })
        }
        Err(err) => {
            debug!("stat failed for {:?}: {err}", path);
            None
        }
    }
}

fn list_dir(path: &Path) -> Option<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("listing failed for {:?}: {err}", path);
            return None;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Some(names)
}
