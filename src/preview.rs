use crate::{fs_cache::FileSystemCache, model::PREVIEW_EXTENSIONS};
use anyhow::{Context, Result};
use log::info;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn preview_candidates(model_path: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let Some(stem) = model_path.file_stem() else {
        return Vec::new();
    };
    let dir = model_path.parent().unwrap_or_else(|| Path::new(""));
    extensions
        .iter()
        .map(|ext| {
            let mut name = stem.to_os_string();
            name.push(ext);
            dir.join(name)
        })
        .collect()
}

fn default_extensions() -> Vec<String> {
    PREVIEW_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}

pub fn find_preview(model_path: &Path) -> Option<PathBuf> {
    preview_candidates(model_path, &default_extensions())
        .into_iter()
        .find(|candidate| candidate.is_file())
}

pub fn find_preview_cached(
    cache: &FileSystemCache,
    model_path: &Path,
    extensions: &[String],
) -> Option<PathBuf> {
    preview_candidates(model_path, extensions)
        .into_iter()
        .find(|candidate| {
            let info = cache.get_file_info(candidate);
            info.exists && !info.is_dir
        })
}

/// Decodes `bytes` as any supported image and stores it as `<stem>.png` next
/// to the model.
pub fn replace_preview(model_path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let target = model_path.with_extension("png");
    let decoded = image::load_from_memory(bytes).context("unsupported preview image data")?;
    decoded
        .save_with_format(&target, image::ImageFormat::Png)
        .with_context(|| format!("failed to write preview {:?}", target))?;
    info!("Saved preview {:?}", target);
    Ok(target)
}

pub fn replace_preview_from_file(model_path: &Path, source: &Path) -> Result<PathBuf> {
    let bytes = fs::read(source).with_context(|| format!("failed to read image {:?}", source))?;
    replace_preview(model_path, &bytes)
}

pub fn delete_preview(model_path: &Path) -> Result<Option<PathBuf>> {
    match find_preview(model_path) {
        Some(path) => {
            fs::remove_file(&path).with_context(|| format!("failed to remove {:?}", path))?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

pub fn open_in_viewer(path: &Path) -> Result<()> {
    open::that(path).with_context(|| format!("failed to open {:?}", path))?;
    Ok(())
}
