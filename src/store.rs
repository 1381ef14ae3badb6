use crate::{
    config::{AppSettings, LibraryConfig},
    model::{normalize_key, ModelMetadataRecord, APP_SETTINGS_KEY},
};
use anyhow::{Context, Result};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

pub type Document = Map<String, Value>;

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma pattern"));
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    keep_backup: bool,
    lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(config: &LibraryConfig) -> Self {
        Self {
            path: config.info_file.clone(),
            keep_backup: config.keep_backup,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `mutate` against the freshly loaded document and writes the result
    /// back before releasing the store lock.
    pub fn transaction<R, F>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut Document) -> R,
    {
        let _guard = self.lock.lock().expect("metadata store poisoned");
        let mut document = self
            .load_locked()
            .with_context(|| format!("failed to read metadata file {:?}", self.path))?;
        let result = mutate(&mut document);
        self.write_locked(&document)?;
        Ok(result)
    }

    pub fn get(&self, key: &str) -> ModelMetadataRecord {
        let key = normalize_key(key);
        let _guard = self.lock.lock().expect("metadata store poisoned");
        let document = self.load_or_empty();
        document
            .get(&key)
            .map(|value| record_from_value(&key, value))
            .unwrap_or_default()
    }

    /// Replaces the record for `key`. The stored favorite flag always wins over
    /// the caller's, fields the caller does not know about are carried over,
    /// and `last_modified` is stamped with the current time.
    pub fn save(&self, key: &str, record: ModelMetadataRecord) -> Result<ModelMetadataRecord> {
        let key = normalize_key(key);
        self.transaction(|document| {
            let previous = document
                .get(&key)
                .map(|value| record_from_value(&key, value))
                .unwrap_or_default();
            let merged = merge_for_save(previous, record);
            document.insert(key.clone(), record_to_value(&merged));
            merged
        })
    }

    pub fn update<F>(&self, key: &str, mutate: F) -> Result<ModelMetadataRecord>
    where
        F: FnOnce(&mut ModelMetadataRecord),
    {
        let key = normalize_key(key);
        self.transaction(|document| {
            let previous = document
                .get(&key)
                .map(|value| record_from_value(&key, value))
                .unwrap_or_default();
            let mut next = previous.clone();
            mutate(&mut next);
            let merged = merge_for_save(previous, next);
            document.insert(key.clone(), record_to_value(&merged));
            merged
        })
    }

    pub fn set_favorite(&self, key: &str, favorite: bool) -> Result<()> {
        let key = normalize_key(key);
        self.transaction(|document| {
            let entry = document
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(fields) = entry {
                fields.insert("is_favorite".to_string(), Value::Bool(favorite));
            }
        })
    }

    pub fn toggle_favorite(&self, key: &str) -> Result<bool> {
        let key = normalize_key(key);
        self.transaction(|document| {
            let current = document
                .get(&key)
                .map(|value| record_from_value(&key, value).is_favorite)
                .unwrap_or(false);
            let entry = document
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(fields) = entry {
                fields.insert("is_favorite".to_string(), Value::Bool(!current));
            }
            !current
        })
    }

    pub fn remove(&self, key: &str) -> Result<Option<ModelMetadataRecord>> {
        let key = normalize_key(key);
        if key == APP_SETTINGS_KEY {
            return Ok(None);
        }
        self.transaction(|document| {
            document
                .remove(&key)
                .map(|value| record_from_value(&key, &value))
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let from = normalize_key(from);
        let to = normalize_key(to);
        self.transaction(|document| match document.remove(&from) {
            Some(value) => {
                document.insert(to, value);
                true
            }
            None => false,
        })
    }

    pub fn duplicate(&self, from: &str, to: &str) -> Result<bool> {
        let from = normalize_key(from);
        let to = normalize_key(to);
        self.transaction(|document| match document.get(&from).cloned() {
            Some(mut value) => {
                if let Value::Object(fields) = &mut value {
                    fields.insert("is_favorite".to_string(), Value::Bool(false));
                }
                document.insert(to, value);
                true
            }
            None => false,
        })
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        let _guard = self.lock.lock().expect("metadata store poisoned");
        let document = self.load_or_empty();
        let records = document
            .iter()
            .filter(|(key, _)| key.as_str() != APP_SETTINGS_KEY)
            .map(|(key, value)| (key.clone(), record_from_value(key, value)))
            .collect();
        MetadataSnapshot { records }
    }

    pub fn favorites(&self) -> HashSet<String> {
        self.snapshot().favorites()
    }

    pub fn ensure_favorite_field(&self) -> Result<usize> {
        self.transaction(|document| {
            let mut touched = 0;
            for (key, value) in document.iter_mut() {
                if key == APP_SETTINGS_KEY {
                    continue;
                }
                if let Value::Object(fields) = value {
                    if !fields.contains_key("is_favorite") {
                        fields.insert("is_favorite".to_string(), Value::Bool(false));
                        touched += 1;
                    }
                }
            }
            touched
        })
    }

    pub fn app_settings(&self) -> AppSettings {
        let _guard = self.lock.lock().expect("metadata store poisoned");
        let document = self.load_or_empty();
        match document.get(APP_SETTINGS_KEY) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|err| {
                warn!("Ignoring unreadable app settings: {err}");
                AppSettings::default()
            }),
            None => AppSettings::default(),
        }
    }

    pub fn save_app_settings(&self, settings: &AppSettings) -> Result<()> {
        let value = serde_json::to_value(settings).context("failed to serialize app settings")?;
        self.transaction(|document| {
            document.insert(APP_SETTINGS_KEY.to_string(), value);
        })
    }

    /// Reads the document. Only I/O failures other than a missing file are
    /// errors; unparsable contents are repaired or reset in place.
    fn load_locked(&self) -> io::Result<Document> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let empty = Document::new();
                match self.write_locked(&empty) {
                    Ok(()) => info!("Created new metadata file {:?}", self.path),
                    Err(err) => error!("Failed to create metadata file {:?}: {err:#}", self.path),
                }
                return Ok(empty);
            }
            Err(err) => return Err(err),
        };

        let contents = match String::from_utf8(bytes) {
            Ok(contents) => contents,
            Err(err) => {
                error!(
                    "Metadata file {:?} is not valid UTF-8: {err}; replacing bad bytes",
                    self.path
                );
                let lossy = String::from_utf8_lossy(err.as_bytes()).into_owned();
                return Ok(self.recover_locked(&lossy));
            }
        };

        match parse_document(&contents) {
            Ok(document) => Ok(document),
            Err(err) => {
                error!("Metadata file {:?} is malformed: {err}", self.path);
                Ok(self.recover_locked(&contents))
            }
        }
    }

    fn load_or_empty(&self) -> Document {
        self.load_locked().unwrap_or_else(|err| {
            error!("Failed to read metadata file {:?}: {err}", self.path);
            Document::new()
        })
    }

    fn recover_locked(&self, contents: &str) -> Document {
        let document = match parse_document(contents).ok().or_else(|| repair_document(contents)) {
            Some(document) => {
                info!("Repaired metadata file {:?}", self.path);
                document
            }
            None => {
                error!(
                    "Could not repair metadata file {:?}; resetting it to empty",
                    self.path
                );
                Document::new()
            }
        };
        if let Err(err) = self.write_locked(&document) {
            error!("Failed to save recovered metadata: {err:#}");
        }
        document
    }

    fn write_locked(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }

        let serialized =
            serde_json::to_string_pretty(document).context("failed to serialize metadata")?;
        let suffix = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .path
            .with_extension(format!("json.{}.{suffix}.tmp", std::process::id()));

        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {tmp_path:?}"))?;
            file.write_all(serialized.as_bytes())
                .with_context(|| format!("failed to write {tmp_path:?}"))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {tmp_path:?}"))?;
        }

        if self.keep_backup && self.path.exists() {
            let backup = self.path.with_extension("json.bak");
            if let Err(err) = fs::copy(&self.path, &backup) {
                warn!("Failed to back up metadata to {backup:?}: {err}");
            }
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            let _ = fs::remove_file(&tmp_path);
            format!("failed to replace metadata file {:?}", self.path)
        })?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MetadataSnapshot {
    records: HashMap<String, ModelMetadataRecord>,
}

impl MetadataSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = (String, ModelMetadataRecord)>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|(key, record)| (normalize_key(&key), record))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ModelMetadataRecord> {
        self.records.get(key)
    }

    pub fn favorites(&self) -> HashSet<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.is_favorite)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModelMetadataRecord)> {
        self.records.iter()
    }
}

pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn merge_for_save(
    previous: ModelMetadataRecord,
    mut next: ModelMetadataRecord,
) -> ModelMetadataRecord {
    next.is_favorite = previous.is_favorite;
    for (field, value) in previous.extra {
        next.extra.entry(field).or_insert(value);
    }
    next.last_modified = Some(now_timestamp());
    next
}

fn record_from_value(key: &str, value: &Value) -> ModelMetadataRecord {
    serde_json::from_value(value.clone()).unwrap_or_else(|err| {
        warn!("Ignoring unreadable metadata for {key}: {err}");
        ModelMetadataRecord::default()
    })
}

fn record_to_value(record: &ModelMetadataRecord) -> Value {
    serde_json::to_value(record).unwrap_or_else(|_| Value::Object(Map::new()))
}

fn parse_document(contents: &str) -> Result<Document, serde_json::Error> {
    if contents.trim().is_empty() {
        return Ok(Document::new());
    }
    let document: Document = serde_json::from_str(contents)?;
    Ok(normalize_document(document))
}

/// Strips trailing commas, the usual damage from hand edits.
fn repair_document(contents: &str) -> Option<Document> {
    let repaired = TRAILING_COMMA.replace_all(contents, "$1");
    serde_json::from_str::<Document>(&repaired)
        .ok()
        .map(normalize_document)
}

fn normalize_document(document: Document) -> Document {
    let mut normalized = Document::new();
    for (key, value) in document {
        let key = if key == APP_SETTINGS_KEY {
            key
        } else {
            normalize_key(&key)
        };
        normalized.insert(key, value);
    }
    normalized
}
