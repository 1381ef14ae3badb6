use crate::{model::ModelFileRef, store::MetadataStore};
use anyhow::{Context, Result};
use log::info;
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::Read,
    path::Path,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

const CHUNK_BYTES: usize = 1024 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Streams `path` through SHA-256 and returns the lowercase hex digest, or
/// `None` when cancelled. `progress` receives `(bytes_read, total)`.
pub fn sha256_file<F>(path: &Path, cancel: &CancellationToken, mut progress: F) -> Result<Option<String>>
where
    F: FnMut(u64, u64),
{
    let mut file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let total = file
        .metadata()
        .with_context(|| format!("failed to stat {:?}", path))?
        .len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_BYTES];
    let mut read_total = 0u64;
    let mut last_report = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {:?}", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        read_total += n as u64;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            progress(read_total, total);
            last_report = Instant::now();
        }
    }
    progress(read_total, total);

    Ok(Some(format!("{:x}", hasher.finalize())))
}

pub fn update_hash<F>(
    store: &MetadataStore,
    root: &Path,
    model: &ModelFileRef,
    cancel: &CancellationToken,
    progress: F,
) -> Result<Option<String>>
where
    F: FnMut(u64, u64),
{
    let path = model.absolute_path(root);
    let Some(digest) = sha256_file(&path, cancel, progress)? else {
        return Ok(None);
    };
    if cancel.is_cancelled() {
        return Ok(None);
    }
    store.update(&model.key(), |record| record.hash = digest.clone())?;
    info!("Stored hash for {model}");
    Ok(Some(digest))
}
