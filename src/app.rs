use crate::{
    batch::BatchEnv,
    catalog::CatalogService,
    config::{ConfigStore, LibraryConfig},
    filter::{filter_and_sort, FilterQuery, SortContext},
    model::{ModelFileRef, SortKey},
    scrape::Scraper,
    store::MetadataStore,
    tasks::{TaskEvent, TaskQueue},
};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::{mpsc::Sender, Arc};
use tokio::runtime::{Builder, Runtime};

pub const APP_NAME: &str = "model-shelf";

/// Everything one open library needs, wired together once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub library: Arc<LibraryConfig>,
    pub store: Arc<MetadataStore>,
    pub config: Arc<ConfigStore>,
    pub catalog: Arc<CatalogService>,
    pub scraper: Arc<Scraper>,
    pub tasks: Arc<TaskQueue>,
}

impl AppContext {
    pub fn new(library: LibraryConfig, events: Sender<TaskEvent>) -> Result<Self> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
        );

        let library = Arc::new(library);
        let store = Arc::new(MetadataStore::new(&library));
        match store.ensure_favorite_field() {
            Ok(0) => {}
            Ok(added) => info!("Added favorite flag to {added} records"),
            Err(err) => warn!("Could not upgrade metadata records: {err:#}"),
        }
        let config = Arc::new(ConfigStore::new(store.clone()));
        let catalog = Arc::new(CatalogService::new(library.clone()));
        let scraper = Arc::new(Scraper::new(&library)?);
        let tasks = Arc::new(TaskQueue::new(runtime.handle().clone(), events));

        info!("Opened model library at {:?}", library.root);
        Ok(Self {
            runtime,
            library,
            store,
            config,
            catalog,
            scraper,
            tasks,
        })
    }

    pub fn batch_env(&self) -> BatchEnv<'_> {
        BatchEnv {
            root: &self.library.root,
            store: &self.store,
            scraper: Some(&self.scraper),
            runtime: Some(self.runtime.handle().clone()),
        }
    }

    pub fn saved_sort(&self) -> SortKey {
        self.config
            .settings()
            .sort
            .and_then(|slug| SortKey::from_slug(&slug))
            .unwrap_or_default()
    }

    pub fn visible_models(&self, query: &FilterQuery, sort: SortKey) -> Vec<ModelFileRef> {
        let metadata = self.store.snapshot();
        let ctx = SortContext {
            root: &self.library.root,
            cache: self.catalog.cache(),
            metadata: &metadata,
            preview_extensions: &self.library.preview_extensions,
        };
        filter_and_sort(&self.catalog.catalog_snapshot(), query, sort, &ctx)
    }

    pub fn resolve(&self, key: &str) -> Result<ModelFileRef> {
        self.catalog
            .find(key)
            .ok_or_else(|| crate::library::LibraryError::MissingModel(key.to_string()).into())
    }
}
