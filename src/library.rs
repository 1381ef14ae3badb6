use crate::{
    artifacts::{config_folder, sidecar_path},
    config::LibraryConfig,
    fs_cache::FileSystemCache,
    model::{file_stem, normalize_key, ModelFileRef},
    preview::find_preview,
    store::MetadataStore,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const COPY_SUFFIX: &str = "(副本)";

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("{0:?} is not a directory")]
    InvalidDirectory(PathBuf),
    #[error("model {0} does not exist")]
    MissingModel(String),
    #[error("{0:?} already exists")]
    AlreadyExists(PathBuf),
}

/// Files that travel with a model: its WebUI sidecar, its preview, and its
/// describe-file folder. Only existing ones are listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Siblings {
    pub sidecar: Option<PathBuf>,
    pub preview: Option<PathBuf>,
    pub config_folder: Option<PathBuf>,
}

impl Siblings {
    pub fn of(model_path: &Path) -> Self {
        let sidecar = Some(sidecar_path(model_path)).filter(|path| path.is_file());
        let folder = Some(config_folder(model_path)).filter(|path| path.is_dir());
        Self {
            sidecar,
            preview: find_preview(model_path),
            config_folder: folder,
        }
    }
}

fn existing_model(config: &LibraryConfig, model: &ModelFileRef) -> Result<PathBuf> {
    let path = model.absolute_path(&config.root);
    if !path.is_file() {
        return Err(LibraryError::MissingModel(model.key()).into());
    }
    Ok(path)
}

fn require_target_dir(target_dir: &Path) -> Result<()> {
    if target_dir.as_os_str().is_empty() {
        return Err(LibraryError::EmptyField("target directory").into());
    }
    if !target_dir.is_dir() {
        return Err(LibraryError::InvalidDirectory(target_dir.to_path_buf()).into());
    }
    Ok(())
}

fn library_folder(config: &LibraryConfig, dir: &Path) -> Option<String> {
    config
        .relative_to_root(dir)
        .map(|relative| normalize_key(&relative.to_string_lossy()))
}

#[derive(Clone, Debug, Default)]
pub struct DeleteReport {
    pub removed: Vec<PathBuf>,
    pub metadata_removed: bool,
}

/// Deletes a model together with its sidecar, preview, describe folder and
/// metadata record.
pub fn delete_model(
    config: &LibraryConfig,
    store: &MetadataStore,
    model: &ModelFileRef,
) -> Result<DeleteReport> {
    let path = existing_model(config, model)?;
    let siblings = Siblings::of(&path);
    let mut report = DeleteReport::default();

    fs::remove_file(&path).with_context(|| format!("failed to delete {:?}", path))?;
    report.removed.push(path);

    for file in [siblings.sidecar, siblings.preview].into_iter().flatten() {
        fs::remove_file(&file).with_context(|| format!("failed to delete {:?}", file))?;
        report.removed.push(file);
    }
    if let Some(folder) = siblings.config_folder {
        fs::remove_dir_all(&folder).with_context(|| format!("failed to delete {:?}", folder))?;
        report.removed.push(folder);
    }

    report.metadata_removed = store.remove(&model.key())?.is_some();
    info!("Deleted {model} and {} related paths", report.removed.len() - 1);
    Ok(report)
}

#[derive(Clone, Debug)]
pub struct TransferOutcome {
    pub destination: PathBuf,
    pub new_ref: Option<ModelFileRef>,
    pub metadata_updated: bool,
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Err(rename_err) = fs::rename(from, to) {
        warn!("Rename {:?} -> {:?} failed ({rename_err}); copying instead", from, to);
        if from.is_dir() {
            copy_dir_recursive(from, to)?;
            fs::remove_dir_all(from).with_context(|| format!("failed to remove {:?}", from))?;
        } else {
            fs::copy(from, to).with_context(|| format!("failed to copy {:?} to {:?}", from, to))?;
            fs::remove_file(from).with_context(|| format!("failed to remove {:?}", from))?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("failed to create {:?}", to))?;
    for entry in fs::read_dir(from).with_context(|| format!("failed to read {:?}", from))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {:?}", entry.path()))?;
        }
    }
    Ok(())
}

fn with_stem(path: &Path, dir: &Path, new_stem: &str) -> PathBuf {
    let mut name = new_stem.to_string();
    if let Some(ext) = path.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    dir.join(name)
}

pub fn move_model(
    config: &LibraryConfig,
    store: &MetadataStore,
    model: &ModelFileRef,
    target_dir: &Path,
) -> Result<TransferOutcome> {
    let source = existing_model(config, model)?;
    require_target_dir(target_dir)?;

    let destination = target_dir.join(&model.file_name);
    if destination.exists() {
        return Err(LibraryError::AlreadyExists(destination).into());
    }
    let siblings = Siblings::of(&source);

    move_path(&source, &destination)?;
    // The record follows the model file even if a related file fails to move.
    let new_ref = library_folder(config, target_dir)
        .map(|folder| ModelFileRef::new(model.file_name.clone(), folder));
    let metadata_updated = match &new_ref {
        Some(new_ref) => {
            store.rename(&model.key(), &new_ref.key())?;
            true
        }
        None => false,
    };

    if let Some(sidecar) = siblings.sidecar {
        move_path(&sidecar, &sidecar_path(&destination))?;
    }
    if let Some(preview) = siblings.preview {
        let stem = model.stem();
        move_path(&preview, &with_stem(&preview, target_dir, stem))?;
    }
    if let Some(folder) = siblings.config_folder {
        move_path(&folder, &config_folder(&destination))?;
    }

    info!("Moved {model} to {:?}", destination);
    Ok(TransferOutcome {
        destination,
        new_ref,
        metadata_updated,
    })
}

/// First free name in `dir`: the original, then `<stem>(副本)<ext>`, then
/// `<stem>(副本)2<ext>` and so on.
pub fn copy_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_stem(file_name);
    let ext = &file_name[stem.len()..];
    let mut counter = 1u32;
    loop {
        let suffix = if counter > 1 {
            format!("{COPY_SUFFIX}{counter}")
        } else {
            COPY_SUFFIX.to_string()
        };
        let candidate = dir.join(format!("{stem}{suffix}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

pub fn copy_model(
    config: &LibraryConfig,
    store: &MetadataStore,
    model: &ModelFileRef,
    target_dir: &Path,
) -> Result<TransferOutcome> {
    let source = existing_model(config, model)?;
    require_target_dir(target_dir)?;

    let destination = copy_destination(target_dir, &model.file_name);
    let new_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| model.file_name.clone());
    let new_stem = file_stem(&new_name).to_string();
    let siblings = Siblings::of(&source);

    fs::copy(&source, &destination)
        .with_context(|| format!("failed to copy {:?} to {:?}", source, destination))?;
    if let Some(sidecar) = siblings.sidecar {
        fs::copy(&sidecar, sidecar_path(&destination))
            .with_context(|| format!("failed to copy {:?}", sidecar))?;
    }
    if let Some(preview) = siblings.preview {
        fs::copy(&preview, with_stem(&preview, target_dir, &new_stem))
            .with_context(|| format!("failed to copy {:?}", preview))?;
    }
    if let Some(folder) = siblings.config_folder {
        copy_dir_recursive(&folder, &config_folder(&destination))?;
    }

    let new_ref = library_folder(config, target_dir).map(|folder| ModelFileRef::new(new_name, folder));
    let metadata_updated = match &new_ref {
        Some(new_ref) => store.duplicate(&model.key(), &new_ref.key())?,
        None => false,
    };
    info!("Copied {model} to {:?}", destination);
    Ok(TransferOutcome {
        destination,
        new_ref,
        metadata_updated,
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibraryStats {
    pub count: usize,
    pub total_bytes: u64,
}

impl std::fmt::Display for LibraryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} models, {}", self.count, format_size(self.total_bytes))
    }
}

pub fn library_stats(root: &Path, cache: &FileSystemCache, models: &[ModelFileRef]) -> LibraryStats {
    let total_bytes = models
        .iter()
        .map(|model| cache.get_file_info(&model.absolute_path(root)))
        .filter(|info| info.exists)
        .map(|info| info.size)
        .sum();
    LibraryStats {
        count: models.len(),
        total_bytes,
    }
}

pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelMetadataRecord;

    struct Fixture {
        dir: tempfile::TempDir,
        config: LibraryConfig,
        store: MetadataStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = LibraryConfig::new(dir.path());
            let store = MetadataStore::new(&config);
            Self { dir, config, store }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, relative: &str) -> PathBuf {
            let path = self.root().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, relative.as_bytes()).unwrap();
            path
        }

        fn full_model(&self) -> ModelFileRef {
            self.write("loras/style.safetensors");
            self.write("loras/style.json");
            self.write("loras/style.jpg");
            self.write("loras/style/Describe.txt");
            self.store
                .save(
                    "loras/style.safetensors",
                    ModelMetadataRecord {
                        model_type: "SDXL".into(),
                        ..Default::default()
                    },
                )
                .unwrap();
            self.store.set_favorite("loras/style.safetensors", true).unwrap();
            ModelFileRef::new("style.safetensors", "loras")
        }
    }

    #[test]
    fn delete_cascades_to_related_files() {
        let fx = Fixture::new();
        let model = fx.full_model();
        fx.write("loras/style.png.bak");

        let report = delete_model(&fx.config, &fx.store, &model).unwrap();
        assert!(report.metadata_removed);
        assert_eq!(report.removed.len(), 4);
        for gone in ["style.safetensors", "style.json", "style.jpg", "style"] {
            assert!(!fx.root().join("loras").join(gone).exists(), "{gone} survived");
        }
        assert!(fx.root().join("loras/style.png.bak").exists());
        assert!(fx.store.get("loras/style.safetensors").is_empty());
    }

    #[test]
    fn delete_missing_model_is_rejected() {
        let fx = Fixture::new();
        let err = delete_model(&fx.config, &fx.store, &ModelFileRef::new("x.pt", "loras")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LibraryError>(),
            Some(LibraryError::MissingModel(_))
        ));
    }

    #[test]
    fn move_inside_library_rekeys_metadata() {
        let fx = Fixture::new();
        let model = fx.full_model();
        let target = fx.root().join("loras/sdxl");
        fs::create_dir_all(&target).unwrap();

        let outcome = move_model(&fx.config, &fx.store, &model, &target).unwrap();
        assert!(outcome.metadata_updated);
        assert_eq!(
            outcome.new_ref,
            Some(ModelFileRef::new("style.safetensors", "loras/sdxl"))
        );
        for moved in ["style.safetensors", "style.json", "style.jpg", "style/Describe.txt"] {
            assert!(target.join(moved).exists(), "{moved} missing");
        }
        let record = fx.store.get("loras/sdxl/style.safetensors");
        assert!(record.is_favorite);
        assert_eq!(record.model_type, "SDXL");
        assert!(fx.store.get("loras/style.safetensors").is_empty());
    }

    #[test]
    fn failed_sibling_move_keeps_record_with_model() {
        let fx = Fixture::new();
        let model = fx.full_model();
        let target = fx.root().join("loras/sdxl");
        fx.write("loras/sdxl/style.json/blocker.txt");

        assert!(move_model(&fx.config, &fx.store, &model, &target).is_err());
        assert!(target.join("style.safetensors").exists());
        assert!(fx.store.get("loras/sdxl/style.safetensors").is_favorite);
        assert!(fx.store.get("loras/style.safetensors").is_empty());
    }

    #[test]
    fn move_outside_library_leaves_metadata() {
        let fx = Fixture::new();
        let model = fx.full_model();
        let outside = tempfile::tempdir().unwrap();

        let outcome = move_model(&fx.config, &fx.store, &model, outside.path()).unwrap();
        assert!(!outcome.metadata_updated);
        assert!(outcome.new_ref.is_none());
        assert!(outside.path().join("style.safetensors").exists());
        assert!(fx.store.get("loras/style.safetensors").is_favorite);
    }

    #[test]
    fn copy_names_duplicates_and_resets_favorite() {
        let fx = Fixture::new();
        let model = fx.full_model();
        let folder = fx.root().join("loras");

        let first = copy_model(&fx.config, &fx.store, &model, &folder).unwrap();
        assert_eq!(first.destination, folder.join("style(副本).safetensors"));
        assert!(folder.join("style(副本).json").exists());
        assert!(folder.join("style(副本).jpg").exists());
        assert!(folder.join("style(副本)/Describe.txt").exists());
        assert!(first.metadata_updated);

        let copy = fx.store.get("loras/style(副本).safetensors");
        assert!(!copy.is_favorite);
        assert_eq!(copy.model_type, "SDXL");

        let second = copy_model(&fx.config, &fx.store, &model, &folder).unwrap();
        assert_eq!(second.destination, folder.join("style(副本)2.safetensors"));
        assert!(fx.store.get("loras/style.safetensors").is_favorite);
    }

    #[test]
    fn transfers_reject_bad_targets() {
        let fx = Fixture::new();
        let model = fx.full_model();

        let err = move_model(&fx.config, &fx.store, &model, Path::new("")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LibraryError>(),
            Some(LibraryError::EmptyField(_))
        ));
        let err = copy_model(&fx.config, &fx.store, &model, &fx.root().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LibraryError>(),
            Some(LibraryError::InvalidDirectory(_))
        ));
        assert!(fx.root().join("loras/style.safetensors").exists());
    }

    #[test]
    fn stats_sum_sizes() {
        let fx = Fixture::new();
        fx.write("loras/a.pt");
        fx.write("loras/bb.pt");
        let models = vec![
            ModelFileRef::new("a.pt", "loras"),
            ModelFileRef::new("bb.pt", "loras"),
            ModelFileRef::new("gone.pt", "loras"),
        ];
        let stats = library_stats(fx.root(), &FileSystemCache::default(), &models);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_bytes, "loras/a.pt".len() as u64 + "loras/bb.pt".len() as u64);
    }

    #[test]
    fn sizes_format_with_binary_units() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
        assert_eq!(format_size(2 * 1024u64.pow(4)), "2.0 TB");
    }
}
