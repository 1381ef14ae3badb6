use crate::{
    fs_cache::FileSystemCache,
    model::{ModelFileRef, SortKey, SubfolderFilter},
    preview::find_preview_cached,
    store::MetadataSnapshot,
};
use std::{
    cmp::{Ordering, Reverse},
    collections::HashMap,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterQuery {
    pub category: String,
    pub subfolder: Option<SubfolderFilter>,
    pub search: String,
}

impl FilterQuery {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn with_subfolder(mut self, subfolder: Option<SubfolderFilter>) -> Self {
        self.subfolder = subfolder;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn matches(&self, model: &ModelFileRef, metadata: &MetadataSnapshot) -> bool {
        let segments = model.folder_segments();
        if segments.first().copied() != Some(self.category.as_str()) {
            return false;
        }

        match &self.subfolder {
            None => {}
            Some(SubfolderFilter::Other) => {
                if segments.len() != 1 {
                    return false;
                }
            }
            Some(SubfolderFilter::Favorites) => {
                let favorite = metadata
                    .get(&model.key())
                    .map(|record| record.is_favorite)
                    .unwrap_or(false);
                if !favorite {
                    return false;
                }
            }
            Some(SubfolderFilter::Named(name)) => {
                if segments.get(1).copied() != Some(name.as_str()) {
                    return false;
                }
            }
        }

        let term = self.search.to_lowercase();
        if term.is_empty() {
            return true;
        }
        if model.file_name.to_lowercase().contains(&term)
            || model.relative_folder.to_lowercase().contains(&term)
        {
            return true;
        }
        metadata
            .get(&model.key())
            .map(|record| record.model_type.to_lowercase().contains(&term))
            .unwrap_or(false)
    }
}

pub fn filter(
    catalog: &[ModelFileRef],
    query: &FilterQuery,
    metadata: &MetadataSnapshot,
) -> Vec<ModelFileRef> {
    catalog
        .iter()
        .filter(|model| query.matches(model, metadata))
        .cloned()
        .collect()
}

pub struct SortContext<'a> {
    pub root: &'a Path,
    pub cache: &'a FileSystemCache,
    pub metadata: &'a MetadataSnapshot,
    pub preview_extensions: &'a [String],
}

impl SortContext<'_> {
    fn path_of(&self, model: &ModelFileRef) -> PathBuf {
        model.absolute_path(self.root)
    }

    fn mtime(&self, model: &ModelFileRef) -> f64 {
        self.cache.get_file_info(&self.path_of(model)).mtime
    }

    fn info_modified(&self, model: &ModelFileRef) -> f64 {
        self.metadata
            .get(&model.key())
            .and_then(|record| record.last_modified)
            .unwrap_or_else(|| self.mtime(model))
    }

    fn has_preview(&self, model: &ModelFileRef) -> bool {
        find_preview_cached(self.cache, &self.path_of(model), self.preview_extensions).is_some()
    }

    fn has_url(&self, model: &ModelFileRef) -> bool {
        self.metadata
            .get(&model.key())
            .map(|record| record.has_url())
            .unwrap_or(false)
    }
}

fn name_key(model: &ModelFileRef) -> String {
    model.file_name.to_lowercase()
}

/// Stable sort by `key`. Each file's key is computed once.
pub fn sort(mut files: Vec<ModelFileRef>, key: SortKey, ctx: &SortContext<'_>) -> Vec<ModelFileRef> {
    match key {
        SortKey::NameAsc => files.sort_by_cached_key(name_key),
        SortKey::NameDesc => files.sort_by_cached_key(|m| Reverse(name_key(m))),
        SortKey::DateAsc => sort_by_float(&mut files, |m| ctx.mtime(m), false),
        SortKey::DateDesc => sort_by_float(&mut files, |m| ctx.mtime(m), true),
        SortKey::InfoModifiedDesc => sort_by_float(&mut files, |m| ctx.info_modified(m), true),
        SortKey::NoPreviewFirst => files.sort_by_cached_key(|m| (ctx.has_preview(m), name_key(m))),
        SortKey::NoUrlFirst => files.sort_by_cached_key(|m| (ctx.has_url(m), name_key(m))),
    }
    files
}

fn sort_by_float<F>(files: &mut [ModelFileRef], value: F, descending: bool)
where
    F: Fn(&ModelFileRef) -> f64,
{
    let values: HashMap<ModelFileRef, f64> = files.iter().map(|m| (m.clone(), value(m))).collect();
    files.sort_by(|a, b| {
        let ordering = values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

pub fn filter_and_sort(
    catalog: &[ModelFileRef],
    query: &FilterQuery,
    key: SortKey,
    ctx: &SortContext<'_>,
) -> Vec<ModelFileRef> {
    sort(filter(catalog, query, ctx.metadata), key, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelMetadataRecord, PREVIEW_EXTENSIONS};
    use std::{
        fs,
        time::{Duration, SystemTime},
    };

    fn catalog() -> Vec<ModelFileRef> {
        vec![
            ModelFileRef::new("a.safetensors", "checkpoints"),
            ModelFileRef::new("b.safetensors", "checkpoints/sub"),
            ModelFileRef::new("c.safetensors", "loras"),
        ]
    }

    fn keys(files: &[ModelFileRef]) -> Vec<String> {
        files.iter().map(ModelFileRef::key).collect()
    }

    fn record(model_type: &str, url: &str, favorite: bool) -> ModelMetadataRecord {
        ModelMetadataRecord {
            model_type: model_type.into(),
            url: url.into(),
            is_favorite: favorite,
            ..Default::default()
        }
    }

    fn extensions() -> Vec<String> {
        PREVIEW_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
    }

    #[test]
    fn category_and_subfolder_filters() {
        let metadata = MetadataSnapshot::default();
        let catalog = catalog();

        let all = filter(&catalog, &FilterQuery::category("checkpoints"), &metadata);
        assert_eq!(
            keys(&all),
            vec!["checkpoints/a.safetensors", "checkpoints/sub/b.safetensors"]
        );

        let other = filter(
            &catalog,
            &FilterQuery::category("checkpoints").with_subfolder(Some(SubfolderFilter::Other)),
            &metadata,
        );
        assert_eq!(keys(&other), vec!["checkpoints/a.safetensors"]);

        let sub = filter(
            &catalog,
            &FilterQuery::category("checkpoints")
                .with_subfolder(Some(SubfolderFilter::Named("sub".into()))),
            &metadata,
        );
        assert_eq!(keys(&sub), vec!["checkpoints/sub/b.safetensors"]);
    }

    #[test]
    fn category_must_match_whole_segment() {
        let catalog = vec![ModelFileRef::new("x.pt", "loras_extra")];
        let found = filter(
            &catalog,
            &FilterQuery::category("loras"),
            &MetadataSnapshot::default(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn named_subfolder_matches_only_first_level() {
        let catalog = vec![
            ModelFileRef::new("x.pt", "loras/a/sub"),
            ModelFileRef::new("y.pt", "loras/sub"),
        ];
        let found = filter(
            &catalog,
            &FilterQuery::category("loras").with_subfolder(Some(SubfolderFilter::Named("sub".into()))),
            &MetadataSnapshot::default(),
        );
        assert_eq!(keys(&found), vec!["loras/sub/y.pt"]);
    }

    #[test]
    fn favorites_filter_stays_inside_category() {
        let catalog = catalog();
        let metadata = MetadataSnapshot::from_records([
            ("checkpoints/sub/b.safetensors".to_string(), record("", "", true)),
            ("loras/c.safetensors".to_string(), record("", "", true)),
        ]);
        let found = filter(
            &catalog,
            &FilterQuery::category("checkpoints").with_subfolder(Some(SubfolderFilter::Favorites)),
            &metadata,
        );
        assert_eq!(keys(&found), vec!["checkpoints/sub/b.safetensors"]);
    }

    #[test]
    fn search_checks_name_folder_and_type() {
        let catalog = vec![
            ModelFileRef::new("model_xl.safetensors", "checkpoints"),
            ModelFileRef::new("base.safetensors", "checkpoints"),
            ModelFileRef::new("other.safetensors", "checkpoints"),
            ModelFileRef::new("deep.safetensors", "checkpoints/XLfolder"),
        ];
        let metadata = MetadataSnapshot::from_records([
            ("checkpoints/base.safetensors".to_string(), record("SDXL", "", false)),
            ("checkpoints/other.safetensors".to_string(), record("SD1.5", "", false)),
        ]);
        let found = filter(
            &catalog,
            &FilterQuery::category("checkpoints").with_search("xl"),
            &metadata,
        );
        assert_eq!(
            keys(&found),
            vec![
                "checkpoints/model_xl.safetensors",
                "checkpoints/base.safetensors",
                "checkpoints/XLfolder/deep.safetensors"
            ]
        );

        let padded = filter(
            &catalog,
            &FilterQuery::category("checkpoints").with_search(" xl"),
            &metadata,
        );
        assert!(padded.is_empty());
    }

    #[test]
    fn name_sorts_ignore_case() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::default();
        let metadata = MetadataSnapshot::default();
        let ext = extensions();
        let ctx = SortContext {
            root: dir.path(),
            cache: &cache,
            metadata: &metadata,
            preview_extensions: &ext,
        };
        let files = vec![
            ModelFileRef::new("b.pt", "loras"),
            ModelFileRef::new("A.pt", "loras"),
            ModelFileRef::new("c.pt", "loras"),
        ];

        let asc = sort(files.clone(), SortKey::NameAsc, &ctx);
        assert_eq!(keys(&asc), vec!["loras/A.pt", "loras/b.pt", "loras/c.pt"]);
        let desc = sort(files, SortKey::NameDesc, &ctx);
        assert_eq!(keys(&desc), vec!["loras/c.pt", "loras/b.pt", "loras/A.pt"]);
    }

    #[test]
    fn missing_preview_first_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let loras = dir.path().join("loras");
        fs::create_dir_all(&loras).unwrap();
        for name in ["a.pt", "b.pt", "c.pt", "d.pt"] {
            fs::write(loras.join(name), b"x").unwrap();
        }
        fs::write(loras.join("a.png"), b"p").unwrap();
        fs::write(loras.join("c.webp"), b"p").unwrap();

        let cache = FileSystemCache::new(Duration::from_secs(60));
        let metadata = MetadataSnapshot::default();
        let ext = extensions();
        let ctx = SortContext {
            root: dir.path(),
            cache: &cache,
            metadata: &metadata,
            preview_extensions: &ext,
        };
        let files = vec![
            ModelFileRef::new("d.pt", "loras"),
            ModelFileRef::new("c.pt", "loras"),
            ModelFileRef::new("b.pt", "loras"),
            ModelFileRef::new("a.pt", "loras"),
        ];
        let sorted = sort(files, SortKey::NoPreviewFirst, &ctx);
        assert_eq!(
            keys(&sorted),
            vec!["loras/b.pt", "loras/d.pt", "loras/a.pt", "loras/c.pt"]
        );
    }

    #[test]
    fn missing_url_first_holds_after_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::default();
        let metadata = MetadataSnapshot::from_records([
            ("loras/a.pt".to_string(), record("", "https://civitai.com/models/1", false)),
            ("loras/s/b.pt".to_string(), record("", "", false)),
        ]);
        let ext = extensions();
        let ctx = SortContext {
            root: dir.path(),
            cache: &cache,
            metadata: &metadata,
            preview_extensions: &ext,
        };
        let catalog = vec![
            ModelFileRef::new("a.pt", "loras"),
            ModelFileRef::new("c.pt", "loras"),
            ModelFileRef::new("b.pt", "loras/s"),
        ];

        let view = filter_and_sort(&catalog, &FilterQuery::category("loras"), SortKey::NoUrlFirst, &ctx);
        assert_eq!(keys(&view), vec!["loras/s/b.pt", "loras/c.pt", "loras/a.pt"]);
    }

    #[test]
    fn info_modified_falls_back_to_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let loras = dir.path().join("loras");
        fs::create_dir_all(&loras).unwrap();
        fs::write(loras.join("old.pt"), b"x").unwrap();
        fs::write(loras.join("edited.pt"), b"x").unwrap();

        let cache = FileSystemCache::default();
        let mut edited = record("", "", false);
        edited.last_modified = Some(4_000_000_000.0);
        let metadata = MetadataSnapshot::from_records([("loras/edited.pt".to_string(), edited)]);
        let ext = extensions();
        let ctx = SortContext {
            root: dir.path(),
            cache: &cache,
            metadata: &metadata,
            preview_extensions: &ext,
        };
        let files = vec![
            ModelFileRef::new("old.pt", "loras"),
            ModelFileRef::new("edited.pt", "loras"),
        ];
        let sorted = sort(files, SortKey::InfoModifiedDesc, &ctx);
        assert_eq!(keys(&sorted), vec!["loras/edited.pt", "loras/old.pt"]);
    }

    #[test]
    fn date_sorts_follow_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let loras = dir.path().join("loras");
        fs::create_dir_all(&loras).unwrap();
        let now = SystemTime::now();
        for (name, age) in [("mid.pt", 60), ("new.pt", 0), ("old.pt", 3600), ("twin.pt", 60)] {
            let path = loras.join(name);
            fs::write(&path, b"x").unwrap();
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(now - Duration::from_secs(age))
                .unwrap();
        }

        let cache = FileSystemCache::default();
        let metadata = MetadataSnapshot::default();
        let ext = extensions();
        let ctx = SortContext {
            root: dir.path(),
            cache: &cache,
            metadata: &metadata,
            preview_extensions: &ext,
        };
        let files = vec![
            ModelFileRef::new("twin.pt", "loras"),
            ModelFileRef::new("new.pt", "loras"),
            ModelFileRef::new("mid.pt", "loras"),
            ModelFileRef::new("old.pt", "loras"),
        ];

        let ascending = sort(files.clone(), SortKey::DateAsc, &ctx);
        assert_eq!(
            keys(&ascending),
            vec!["loras/old.pt", "loras/twin.pt", "loras/mid.pt", "loras/new.pt"]
        );
        let descending = sort(files, SortKey::DateDesc, &ctx);
        assert_eq!(
            keys(&descending),
            vec!["loras/new.pt", "loras/twin.pt", "loras/mid.pt", "loras/old.pt"]
        );
    }
}
