use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const MODEL_EXTENSIONS: &[&str] = &[".safetensors", ".ckpt", ".bin", ".pth", ".gguf", ".pt"];
pub const PREVIEW_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp"];

pub const APP_SETTINGS_KEY: &str = "_app_settings";

pub const PINNED_CATEGORIES: &[&str] = &["checkpoints", "loras"];

pub fn is_model_file(name: &str) -> bool {
    MODEL_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// One model file in the catalog, identified by its name and the `/`-separated
/// folder it lives in relative to the library root (category included).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ModelFileRef {
    pub file_name: String,
    pub relative_folder: String,
}

impl ModelFileRef {
    pub fn new(file_name: impl Into<String>, relative_folder: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            relative_folder: normalize_key(&relative_folder.into()),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if key.ends_with(['/', '\\']) {
            return None;
        }
        let key = normalize_key(key);
        let (folder, file) = match key.rsplit_once('/') {
            Some((folder, file)) => (folder.to_string(), file.to_string()),
            None => (String::new(), key.clone()),
        };
        if file.is_empty() {
            return None;
        }
        Some(Self {
            file_name: file,
            relative_folder: folder,
        })
    }

    pub fn key(&self) -> String {
        if self.relative_folder.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.relative_folder, self.file_name)
        }
    }

    pub fn folder_segments(&self) -> Vec<&str> {
        self.relative_folder
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    pub fn category(&self) -> Option<&str> {
        self.folder_segments().first().copied()
    }

    pub fn subfolder(&self) -> Option<&str> {
        self.folder_segments().get(1).copied()
    }

    pub fn stem(&self) -> &str {
        file_stem(&self.file_name)
    }

    pub fn absolute_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.folder_segments() {
            path.push(segment);
        }
        path.push(&self.file_name);
        path
    }
}

impl std::fmt::Display for ModelFileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

pub fn file_stem(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(0) | None => file_name,
        Some(index) => &file_name[..index],
    }
}

pub fn normalize_key(key: &str) -> String {
    key.replace('\\', "/").trim_matches('/').to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ModelMetadataRecord {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub model_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub trigger_words: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub hash: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelMetadataRecord {
    pub fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }

    pub fn is_liblib(&self) -> bool {
        self.url.contains("liblib.art")
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn field(&self, field: RecordField) -> &str {
        match field {
            RecordField::Type => &self.model_type,
            RecordField::Url => &self.url,
            RecordField::Description => &self.description,
            RecordField::TriggerWords => &self.trigger_words,
            RecordField::Hash => &self.hash,
        }
    }

    pub fn set_field(&mut self, field: RecordField, value: impl Into<String>) {
        let value = value.into();
        match field {
            RecordField::Type => self.model_type = value,
            RecordField::Url => self.url = value,
            RecordField::Description => self.description = value,
            RecordField::TriggerWords => self.trigger_words = value,
            RecordField::Hash => self.hash = value,
        }
    }
}

/// Older files sometimes hold `null` or numbers where text is expected.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordField {
    Type,
    Url,
    Description,
    TriggerWords,
    Hash,
}

impl RecordField {
    pub fn all() -> &'static [RecordField] {
        use RecordField::*;
        &[Type, Url, Description, TriggerWords, Hash]
    }

    pub fn slug(self) -> &'static str {
        match self {
            RecordField::Type => "type",
            RecordField::Url => "url",
            RecordField::Description => "description",
            RecordField::TriggerWords => "trigger_words",
            RecordField::Hash => "hash",
        }
    }
}

/// Narrows a category listing to one slice of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubfolderFilter {
    Other,
    Favorites,
    Named(String),
}

impl SubfolderFilter {
    pub const OTHER_TOKEN: &'static str = "其他";
    pub const FAVORITES_TOKEN: &'static str = "收藏";

    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        match token {
            "" => None,
            Self::OTHER_TOKEN | "other" => Some(SubfolderFilter::Other),
            Self::FAVORITES_TOKEN | "favorites" => Some(SubfolderFilter::Favorites),
            name => Some(SubfolderFilter::Named(name.to_string())),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            SubfolderFilter::Other => Self::OTHER_TOKEN,
            SubfolderFilter::Favorites => Self::FAVORITES_TOKEN,
            SubfolderFilter::Named(name) => name,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    NameAsc,
    NameDesc,
    DateAsc,
    DateDesc,
    InfoModifiedDesc,
    NoPreviewFirst,
    NoUrlFirst,
}

impl SortKey {
    pub fn all() -> &'static [SortKey] {
        use SortKey::*;
        &[
            NameAsc,
            NameDesc,
            DateAsc,
            DateDesc,
            InfoModifiedDesc,
            NoPreviewFirst,
            NoUrlFirst,
        ]
    }

    pub fn slug(self) -> &'static str {
        match self {
            SortKey::NameAsc => "name_asc",
            SortKey::NameDesc => "name_desc",
            SortKey::DateAsc => "date_asc",
            SortKey::DateDesc => "date_desc",
            SortKey::InfoModifiedDesc => "info_modified_desc",
            SortKey::NoPreviewFirst => "no_preview_first",
            SortKey::NoUrlFirst => "no_url_first",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::all().iter().copied().find(|key| key.slug() == slug)
    }

    pub fn label(self) -> &'static str {
        match self {
            SortKey::NameAsc => "Name (A-Z)",
            SortKey::NameDesc => "Name (Z-A)",
            SortKey::DateAsc => "Oldest file first",
            SortKey::DateDesc => "Newest file first",
            SortKey::InfoModifiedDesc => "Recently edited info",
            SortKey::NoPreviewFirst => "Missing preview first",
            SortKey::NoUrlFirst => "Missing URL first",
        }
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_slug(value.trim()).ok_or_else(|| {
            let known: Vec<&str> = Self::all().iter().map(|key| key.slug()).collect();
            format!("unknown sort key {value:?} (expected one of {})", known.join(", "))
        })
    }
}

pub fn order_categories(mut categories: Vec<String>) -> Vec<String> {
    categories.sort();
    categories.dedup();
    let mut ordered = Vec::with_capacity(categories.len());
    for pinned in PINNED_CATEGORIES {
        if let Some(index) = categories.iter().position(|name| name == pinned) {
            ordered.push(categories.remove(index));
        }
    }
    ordered.extend(categories);
    ordered
}
