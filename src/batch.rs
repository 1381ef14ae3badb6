use crate::{
    artifacts::{write_describe_files, write_webui_sidecar, SidecarMode},
    hashing::update_hash,
    model::ModelFileRef,
    preview::find_preview,
    scrape::{commit, PreviewPolicy, ScrapeError, ScrapeSource, Scraper},
    store::MetadataStore,
};
use anyhow::Result;
use log::{info, warn};
use std::{fmt, path::Path, str::FromStr};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchKind {
    Hash,
    DescribeFiles,
    WebuiSidecars,
    FetchCivitai,
    FetchLiblib,
}

impl BatchKind {
    pub fn all() -> &'static [BatchKind] {
        &[
            BatchKind::Hash,
            BatchKind::DescribeFiles,
            BatchKind::WebuiSidecars,
            BatchKind::FetchCivitai,
            BatchKind::FetchLiblib,
        ]
    }

    pub fn slug(self) -> &'static str {
        match self {
            BatchKind::Hash => "hash",
            BatchKind::DescribeFiles => "describe-files",
            BatchKind::WebuiSidecars => "webui-json",
            BatchKind::FetchCivitai => "civitai",
            BatchKind::FetchLiblib => "liblib",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.slug().eq_ignore_ascii_case(value.trim()))
    }

    pub fn label(self) -> &'static str {
        match self {
            BatchKind::Hash => "Compute hashes",
            BatchKind::DescribeFiles => "Write describe files",
            BatchKind::WebuiSidecars => "Write WebUI sidecars",
            BatchKind::FetchCivitai => "Fetch from Civitai",
            BatchKind::FetchLiblib => "Fetch from Liblib",
        }
    }

    fn needs_scraper(self) -> bool {
        matches!(self, BatchKind::FetchCivitai | BatchKind::FetchLiblib)
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for BatchKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_slug(value).ok_or_else(|| format!("unknown batch operation: {value}"))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    pub preview: PreviewPolicy,
    pub sidecar: SidecarMode,
    pub rehash: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} succeeded, {} skipped, {} failed",
            self.processed, self.succeeded, self.skipped, self.failed
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

enum ItemOutcome {
    Done,
    Skipped,
    Cancelled,
}

pub struct BatchEnv<'a> {
    pub root: &'a Path,
    pub store: &'a MetadataStore,
    pub scraper: Option<&'a Scraper>,
    pub runtime: Option<Handle>,
}

/// Applies `kind` to every model in order. Cancellation is honoured before
/// each item; items already handled stay committed. `progress` receives the
/// zero-based index of the item about to run.
pub fn run_batch<F>(
    env: &BatchEnv<'_>,
    kind: BatchKind,
    models: &[ModelFileRef],
    options: BatchOptions,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<BatchSummary>
where
    F: FnMut(usize, usize, &ModelFileRef),
{
    if kind.needs_scraper() && (env.scraper.is_none() || env.runtime.is_none()) {
        anyhow::bail!("{} needs network access", kind.label());
    }

    let mut summary = BatchSummary::default();
    for (index, model) in models.iter().enumerate() {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        progress(index, models.len(), model);

        match run_item(env, kind, model, options, cancel) {
            Ok(ItemOutcome::Done) => summary.succeeded += 1,
            Ok(ItemOutcome::Skipped) => summary.skipped += 1,
            Ok(ItemOutcome::Cancelled) => {
                summary.cancelled = true;
                break;
            }
            Err(err) => {
                warn!("{} failed for {model}: {err:#}", kind.label());
                summary.failed += 1;
            }
        }
        summary.processed += 1;
    }

    info!("{}: {summary}", kind.label());
    Ok(summary)
}

fn run_item(
    env: &BatchEnv<'_>,
    kind: BatchKind,
    model: &ModelFileRef,
    options: BatchOptions,
    cancel: &CancellationToken,
) -> Result<ItemOutcome> {
    let path = model.absolute_path(env.root);
    match kind {
        BatchKind::Hash => {
            if !options.rehash && !env.store.get(&model.key()).hash.is_empty() {
                return Ok(ItemOutcome::Skipped);
            }
            match update_hash(env.store, env.root, model, cancel, |_, _| {})? {
                Some(_) => Ok(ItemOutcome::Done),
                None => Ok(ItemOutcome::Cancelled),
            }
        }
        BatchKind::DescribeFiles => {
            let written = write_describe_files(&path, &env.store.get(&model.key()))?;
            Ok(if written.is_empty() {
                ItemOutcome::Skipped
            } else {
                ItemOutcome::Done
            })
        }
        BatchKind::WebuiSidecars => {
            write_webui_sidecar(&path, &env.store.get(&model.key()), options.sidecar)?;
            Ok(ItemOutcome::Done)
        }
        BatchKind::FetchCivitai => fetch_civitai_item(env, model, options, cancel),
        BatchKind::FetchLiblib => fetch_liblib_item(env, model, options),
    }
}

fn fetch_civitai_item(
    env: &BatchEnv<'_>,
    model: &ModelFileRef,
    options: BatchOptions,
    cancel: &CancellationToken,
) -> Result<ItemOutcome> {
    let (Some(scraper), Some(runtime)) = (env.scraper, env.runtime.as_ref()) else {
        return Ok(ItemOutcome::Skipped);
    };
    let record = env.store.get(&model.key());
    if record.is_liblib() {
        return Ok(ItemOutcome::Skipped);
    }

    let hash = if record.hash.is_empty() {
        match update_hash(env.store, env.root, model, cancel, |_, _| {})? {
            Some(hash) => hash,
            None => return Ok(ItemOutcome::Cancelled),
        }
    } else {
        record.hash
    };

    let path = model.absolute_path(env.root);
    let want_preview = options.preview.wants_preview(find_preview(&path).is_some());
    match runtime.block_on(scraper.fetch_civitai(&hash, want_preview)) {
        Ok(result) => {
            commit(env.store, env.root, model, ScrapeSource::Civitai, &result)?;
            Ok(ItemOutcome::Done)
        }
        Err(ScrapeError::NotFound) => Ok(ItemOutcome::Skipped),
        Err(err) => Err(err.into()),
    }
}

fn fetch_liblib_item(env: &BatchEnv<'_>, model: &ModelFileRef, options: BatchOptions) -> Result<ItemOutcome> {
    let (Some(scraper), Some(runtime)) = (env.scraper, env.runtime.as_ref()) else {
        return Ok(ItemOutcome::Skipped);
    };
    let record = env.store.get(&model.key());
    if !record.is_liblib() {
        return Ok(ItemOutcome::Skipped);
    }

    let path = model.absolute_path(env.root);
    let want_preview = options.preview.wants_preview(find_preview(&path).is_some());
    match runtime.block_on(scraper.fetch_liblib(&record.url, want_preview)) {
        Ok(result) => {
            commit(env.store, env.root, model, ScrapeSource::Liblib, &result)?;
            Ok(ItemOutcome::Done)
        }
        Err(ScrapeError::NotFound) => Ok(ItemOutcome::Skipped),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LibraryConfig, model::ModelMetadataRecord};
    use std::fs;
    use tokio::runtime::Builder;

    struct Fixture {
        dir: tempfile::TempDir,
        config: LibraryConfig,
        store: MetadataStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = LibraryConfig::new(dir.path());
            config.offline = true;
            let store = MetadataStore::new(&config);
            Self { dir, config, store }
        }

        fn model(&self, name: &str, body: &str) -> ModelFileRef {
            let folder = self.dir.path().join("loras");
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join(name), body).unwrap();
            ModelFileRef::new(name, "loras")
        }

        fn env(&self) -> BatchEnv<'_> {
            BatchEnv {
                root: self.dir.path(),
                store: &self.store,
                scraper: None,
                runtime: None,
            }
        }
    }

    #[test]
    fn hash_batch_skips_known_digests() {
        let fx = Fixture::new();
        let a = fx.model("a.pt", "abc");
        let b = fx.model("b.pt", "other");
        fx.store
            .update(&b.key(), |record| record.hash = "cached".into())
            .unwrap();

        let mut seen = Vec::new();
        let summary = run_batch(
            &fx.env(),
            BatchKind::Hash,
            &[a.clone(), b.clone()],
            BatchOptions::default(),
            &CancellationToken::new(),
            |index, total, _| seen.push((index, total)),
        )
        .unwrap();

        assert_eq!(seen, vec![(0, 2), (1, 2)]);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            fx.store.get(&a.key()).hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fx.store.get(&b.key()).hash, "cached");
    }

    #[test]
    fn cancelled_batch_stops_before_first_item() {
        let fx = Fixture::new();
        let a = fx.model("a.pt", "abc");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_batch(
            &fx.env(),
            BatchKind::Hash,
            &[a.clone()],
            BatchOptions::default(),
            &cancel,
            |_, _, _| {},
        )
        .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert!(fx.store.get(&a.key()).hash.is_empty());
    }

    #[test]
    fn describe_files_skip_empty_records() {
        let fx = Fixture::new();
        let filled = fx.model("filled.pt", "x");
        let empty = fx.model("empty.pt", "y");
        fx.store
            .save(
                &filled.key(),
                ModelMetadataRecord {
                    description: "notes".into(),
                    trigger_words: "tag".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let summary = run_batch(
            &fx.env(),
            BatchKind::DescribeFiles,
            &[filled, empty],
            BatchOptions::default(),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!((summary.succeeded, summary.skipped), (1, 1));
        let folder = fx.dir.path().join("loras/filled");
        assert_eq!(fs::read_to_string(folder.join("Describe.txt")).unwrap(), "notes");
        assert_eq!(fs::read_to_string(folder.join("Trigger_Words.txt")).unwrap(), "tag");
    }

    #[test]
    fn sidecars_are_written_for_every_model() {
        let fx = Fixture::new();
        let a = fx.model("a.safetensors", "x");
        let summary = run_batch(
            &fx.env(),
            BatchKind::WebuiSidecars,
            &[a],
            BatchOptions::default(),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(fx.dir.path().join("loras/a.json").is_file());
    }

    #[test]
    fn fetch_requires_network_handles() {
        let fx = Fixture::new();
        let err = run_batch(
            &fx.env(),
            BatchKind::FetchCivitai,
            &[],
            BatchOptions::default(),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("network"));
    }

    #[test]
    fn fetch_batches_pick_their_source() {
        let fx = Fixture::new();
        let liblib = fx.model("liblib.pt", "x");
        let plain = fx.model("plain.pt", "y");
        fx.store
            .update(&liblib.key(), |record| {
                record.url = "https://www.liblib.art/modelinfo/abc".into()
            })
            .unwrap();

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let scraper = Scraper::new(&fx.config).unwrap();
        let env = BatchEnv {
            scraper: Some(&scraper),
            runtime: Some(rt.handle().clone()),
            ..fx.env()
        };

        // Offline: the eligible model fails, the other one is skipped.
        let civitai = run_batch(
            &env,
            BatchKind::FetchCivitai,
            &[liblib.clone(), plain.clone()],
            BatchOptions::default(),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!((civitai.skipped, civitai.failed), (1, 1));
        assert!(!fx.store.get(&plain.key()).hash.is_empty());

        let liblib_run = run_batch(
            &env,
            BatchKind::FetchLiblib,
            &[liblib, plain],
            BatchOptions::default(),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!((liblib_run.skipped, liblib_run.failed), (1, 1));
    }

    #[test]
    fn kinds_parse_from_slugs() {
        for kind in BatchKind::all() {
            assert_eq!(kind.slug().parse::<BatchKind>().unwrap(), *kind);
        }
        assert!("bogus".parse::<BatchKind>().is_err());
    }
}
