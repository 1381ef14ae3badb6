use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::info;
use model_shelf::{
    app::{AppContext, APP_NAME},
    artifacts::{
        comfy_node_snippet, comfyui_extra_paths, patch_webui_user_bat, webui_commandline_args,
        write_comfyui_extra_paths, write_describe_files, write_webui_sidecar, SidecarMode,
    },
    batch::{run_batch, BatchKind, BatchOptions},
    config::LibraryConfig,
    filter::FilterQuery,
    hashing::update_hash,
    liblib::{liblib_search_url, validate_page_url},
    library::{copy_model, delete_model, format_size, library_stats, move_model},
    model::{ModelFileRef, RecordField, SortKey, SubfolderFilter},
    preview::{delete_preview, find_preview, open_in_viewer, replace_preview_from_file},
    scrape::{commit, PreviewPolicy, ScrapeError, ScrapeSource},
    tasks::{TaskContext, TaskEvent},
};
use std::{
    path::PathBuf,
    sync::mpsc::{channel, Receiver},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = APP_NAME)]
#[command(author, version, about = "Browse and annotate a local Stable Diffusion model library", long_about = None)]
struct Cli {
    /// Library root (defaults to MODEL_SHELF_ROOT or the current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Never touch the network
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    Civitai,
    Liblib,
}

#[derive(Subcommand)]
enum Commands {
    /// List model categories
    Categories,

    /// List models of a category (all categories if omitted)
    #[command(alias = "ls")]
    List {
        #[arg(short, long)]
        category: Option<String>,

        /// Subfolder name, "其他"/"other" or "收藏"/"favorites"
        #[arg(short = 'f', long)]
        subfolder: Option<String>,

        #[arg(short, long, default_value = "")]
        search: String,

        /// name_asc, name_desc, date_asc, date_desc, info_modified_desc,
        /// no_preview_first or no_url_first
        #[arg(long)]
        sort: Option<SortKey>,
    },

    /// List subfolders of a category
    Subfolders { category: String },

    /// Print the size and model count of the library
    Stats {
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Show the metadata of one model (key like "loras/sdxl/style.safetensors")
    Show { key: String },

    /// Edit metadata fields of one model
    Edit {
        key: String,
        #[arg(long = "type")]
        model_type: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        trigger_words: Option<String>,
    },

    /// Toggle the favorite flag
    Favorite { key: String },

    /// Compute and store the SHA-256 of a model
    Hash { key: String },

    /// Fetch preview, trigger words and description from a model site
    Fetch {
        key: String,
        #[arg(short, long, value_enum, default_value = "civitai")]
        source: Source,
        /// Liblib page address (defaults to the stored url)
        #[arg(long)]
        url: Option<String>,
        /// Replace an existing preview image
        #[arg(long)]
        replace_preview: bool,
    },

    /// Run one operation over every listed model
    Batch {
        /// hash, describe-files, webui-json, civitai or liblib
        operation: BatchKind,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(short = 'f', long)]
        subfolder: Option<String>,
        #[arg(short, long, default_value = "")]
        search: String,
        #[arg(long)]
        replace_preview: bool,
        /// Overwrite WebUI sidecars instead of merging
        #[arg(long)]
        overwrite: bool,
        /// Recompute hashes that are already stored
        #[arg(long)]
        rehash: bool,
    },

    /// Delete a model with its preview, sidecar and metadata
    #[command(alias = "rm")]
    Delete {
        key: String,
        #[arg(long)]
        yes: bool,
    },

    /// Move a model and its related files to another folder
    #[command(alias = "mv")]
    Move { key: String, target: PathBuf },

    /// Copy a model and its related files to another folder
    #[command(alias = "cp")]
    Copy { key: String, target: PathBuf },

    /// Manage the preview image of a model
    Preview {
        key: String,
        /// Replace the preview with this image file
        #[arg(long, conflicts_with_all = ["delete", "open"])]
        set: Option<PathBuf>,
        #[arg(long, conflicts_with = "open")]
        delete: bool,
        /// Open the preview in the system viewer
        #[arg(long)]
        open: bool,
    },

    /// Write the SD WebUI sidecar json for a model
    WebuiJson {
        key: String,
        #[arg(long)]
        overwrite: bool,
    },

    /// Write Describe.txt and Trigger_Words.txt for a model
    DescribeFiles { key: String },

    /// Print or install extra_model_paths.yaml for ComfyUI
    ComfyuiConfig {
        comfyui_dir: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },

    /// Print or install the COMMANDLINE_ARGS line for SD WebUI
    WebuiConfig {
        webui_dir: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },

    /// Print a ComfyUI loader node for a model
    Node { key: String },

    /// Print the Liblib search address for a model
    SearchUrl {
        key: String,
        #[arg(long)]
        open: bool,
    },

    /// Show or change saved settings
    Settings {
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        sort: Option<SortKey>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut library = LibraryConfig::from_env()?;
    if let Some(root) = cli.root {
        library = library.with_root(root);
    }
    library.offline |= cli.offline;

    let (events_tx, events_rx) = channel();
    let ctx = AppContext::new(library, events_tx)?;
    scan_library(&ctx, &events_rx)?;

    match cli.command {
        Commands::Categories => {
            for category in ctx.catalog.categories() {
                println!("{category}");
            }
        }
        Commands::List {
            category,
            subfolder,
            search,
            sort,
        } => {
            let sort = sort.unwrap_or_else(|| ctx.saved_sort());
            for category in selected_categories(&ctx, category) {
                let query = FilterQuery::category(&category)
                    .with_subfolder(subfolder.as_deref().and_then(SubfolderFilter::from_token))
                    .with_search(&search);
                for model in ctx.visible_models(&query, sort) {
                    println!("{}", model.key());
                }
            }
        }
        Commands::Subfolders { category } => {
            for name in ctx.catalog.subfolders(&category) {
                println!("{name}");
            }
        }
        Commands::Stats { category } => {
            let catalog = ctx.catalog.catalog_snapshot();
            let models: Vec<ModelFileRef> = match category {
                Some(category) => catalog
                    .into_iter()
                    .filter(|model| model.category() == Some(category.as_str()))
                    .collect(),
                None => catalog,
            };
            println!("{}", library_stats(&ctx.library.root, ctx.catalog.cache(), &models));
        }
        Commands::Show { key } => show(&ctx, &key)?,
        Commands::Edit {
            key,
            model_type,
            url,
            description,
            trigger_words,
        } => {
            let model = ctx.resolve(&key)?;
            let edits = [
                (RecordField::Type, model_type),
                (RecordField::Url, url),
                (RecordField::Description, description),
                (RecordField::TriggerWords, trigger_words),
            ];
            if edits.iter().all(|(_, value)| value.is_none()) {
                bail!("nothing to edit");
            }
            ctx.store.update(&model.key(), |record| {
                for (field, value) in edits {
                    if let Some(value) = value {
                        record.set_field(field, value);
                    }
                }
            })?;
            info!("Saved metadata for {model}");
        }
        Commands::Favorite { key } => {
            let model = ctx.resolve(&key)?;
            let favorite = ctx.store.toggle_favorite(&model.key())?;
            println!("{model}: {}", if favorite { "favorite" } else { "not favorite" });
        }
        Commands::Hash { key } => {
            let model = ctx.resolve(&key)?;
            let digest = update_hash(
                &ctx.store,
                &ctx.library.root,
                &model,
                &CancellationToken::new(),
                |done, total| log::debug!("Hashed {done}/{total} bytes of {model}"),
            )?
            .ok_or_else(|| anyhow!("hashing cancelled"))?;
            println!("{digest}");
        }
        Commands::Fetch {
            key,
            source,
            url,
            replace_preview,
        } => fetch(&ctx, &key, source, url, replace_preview)?,
        Commands::Batch {
            operation,
            category,
            subfolder,
            search,
            replace_preview,
            overwrite,
            rehash,
        } => {
            let mut models = Vec::new();
            for category in selected_categories(&ctx, category) {
                let query = FilterQuery::category(&category)
                    .with_subfolder(subfolder.as_deref().and_then(SubfolderFilter::from_token))
                    .with_search(&search);
                models.extend(ctx.visible_models(&query, ctx.saved_sort()));
            }
            let options = BatchOptions {
                preview: preview_policy(replace_preview),
                sidecar: sidecar_mode(overwrite),
                rehash,
            };
            let job_ctx = ctx.clone();
            let summary = run_task(&ctx, &events_rx, operation.label(), move |task| {
                let env = job_ctx.batch_env();
                let summary = run_batch(
                    &env,
                    operation,
                    &models,
                    options,
                    task.cancel_token(),
                    |index, total, model| {
                        task.progress(index as u64, total as u64, Some(model.key()))
                    },
                )?;
                Ok(summary.to_string())
            })?;
            println!("{summary}");
        }
        Commands::Delete { key, yes } => {
            let model = ctx.resolve(&key)?;
            if !yes {
                bail!("refusing to delete {model} without --yes");
            }
            let report = delete_model(&ctx.library, &ctx.store, &model)?;
            ctx.catalog.apply_change(Some(&model), None);
            for path in report.removed {
                println!("removed {}", path.display());
            }
        }
        Commands::Move { key, target } => {
            let model = ctx.resolve(&key)?;
            let outcome = move_model(&ctx.library, &ctx.store, &model, &target)?;
            ctx.catalog.apply_change(Some(&model), outcome.new_ref);
            println!("{}", outcome.destination.display());
        }
        Commands::Copy { key, target } => {
            let model = ctx.resolve(&key)?;
            let outcome = copy_model(&ctx.library, &ctx.store, &model, &target)?;
            ctx.catalog.apply_change(None, outcome.new_ref);
            println!("{}", outcome.destination.display());
        }
        Commands::Preview {
            key,
            set,
            delete,
            open,
        } => {
            let model = ctx.resolve(&key)?;
            let model_path = ctx.catalog.model_path(&model);
            if let Some(source) = set {
                let saved = replace_preview_from_file(&model_path, &source)?;
                println!("{}", saved.display());
            } else if delete {
                match delete_preview(&model_path)? {
                    Some(path) => println!("removed {}", path.display()),
                    None => println!("{model} has no preview"),
                }
            } else {
                let preview = find_preview(&model_path)
                    .ok_or_else(|| anyhow!("{model} has no preview"))?;
                println!("{}", preview.display());
                if open {
                    open_in_viewer(&preview)?;
                }
            }
        }
        Commands::WebuiJson { key, overwrite } => {
            let model = ctx.resolve(&key)?;
            let path = write_webui_sidecar(
                &ctx.catalog.model_path(&model),
                &ctx.store.get(&model.key()),
                sidecar_mode(overwrite),
            )?;
            println!("{}", path.display());
        }
        Commands::DescribeFiles { key } => {
            let model = ctx.resolve(&key)?;
            let written =
                write_describe_files(&ctx.catalog.model_path(&model), &ctx.store.get(&model.key()))?;
            if written.is_empty() {
                println!("{model} has no description or trigger words");
            }
            for path in written {
                println!("{}", path.display());
            }
        }
        Commands::ComfyuiConfig { comfyui_dir, force } => match comfyui_dir {
            Some(dir) => {
                let path = write_comfyui_extra_paths(&dir, &ctx.library.root, force)?;
                println!("{}", path.display());
            }
            None => print!("{}", comfyui_extra_paths(&ctx.library.root)),
        },
        Commands::WebuiConfig { webui_dir, force } => match webui_dir {
            Some(dir) => {
                let path = patch_webui_user_bat(&dir, &ctx.library.root, force)?;
                println!("{}", path.display());
            }
            None => println!("{}", webui_commandline_args(&ctx.library.root)),
        },
        Commands::Node { key } => {
            let model = ctx.resolve(&key)?;
            let category = model.category().unwrap_or_default();
            let node = comfy_node_snippet(category, &model.file_name)
                .ok_or_else(|| anyhow!("no ComfyUI loader for category {category:?}"))?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        Commands::SearchUrl { key, open } => {
            let model = ctx.resolve(&key)?;
            let url = liblib_search_url(&model.file_name);
            println!("{url}");
            if open {
                open::that(&url).with_context(|| format!("failed to open {url}"))?;
            }
        }
        Commands::Settings { theme, sort } => {
            let settings = if theme.is_none() && sort.is_none() {
                ctx.config.settings()
            } else {
                ctx.config.update_settings(|settings| {
                    if let Some(theme) = theme {
                        settings.theme = theme;
                    }
                    if let Some(sort) = sort {
                        settings.sort = Some(sort.slug().to_string());
                    }
                })?
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

fn selected_categories(ctx: &AppContext, category: Option<String>) -> Vec<String> {
    match category {
        Some(category) => vec![category],
        None => ctx.catalog.categories(),
    }
}

fn preview_policy(replace: bool) -> PreviewPolicy {
    if replace {
        PreviewPolicy::Replace
    } else {
        PreviewPolicy::OnlyIfMissing
    }
}

fn sidecar_mode(overwrite: bool) -> SidecarMode {
    if overwrite {
        SidecarMode::Overwrite
    } else {
        SidecarMode::Merge
    }
}

fn scan_library(ctx: &AppContext, events: &Receiver<TaskEvent>) -> Result<()> {
    let catalog = ctx.catalog.clone();
    run_task(ctx, events, "Scan library", move |task| {
        let count = catalog
            .refresh(task.cancel_token())
            .ok_or_else(|| anyhow!("scan cancelled"))?;
        Ok(format!("{count} models"))
    })?;
    Ok(())
}

/// Queues `job` and blocks until it reports a terminal event.
fn run_task<F>(ctx: &AppContext, events: &Receiver<TaskEvent>, label: &str, job: F) -> Result<String>
where
    F: FnOnce(&TaskContext) -> Result<String> + Send + 'static,
{
    let handle = ctx.tasks.submit_exclusive(label, job)?;
    for event in events.iter() {
        if event.id() != handle.id {
            continue;
        }
        match event {
            TaskEvent::Started { label, .. } => info!("{label} started"),
            TaskEvent::Progress {
                done,
                total,
                message,
                ..
            } => info!(
                "[{}/{total}] {}",
                done + 1,
                message.unwrap_or_default()
            ),
            TaskEvent::Finished { summary, .. } => return Ok(summary),
            TaskEvent::Failed { error, .. } => bail!("{label} failed: {error}"),
            TaskEvent::Cancelled { .. } => bail!("{label} was cancelled"),
        }
    }
    Err(anyhow!("task worker stopped before {label} finished"))
}

fn show(ctx: &AppContext, key: &str) -> Result<()> {
    let model = ctx.resolve(key)?;
    let model_path = ctx.catalog.model_path(&model);
    let record = ctx.store.get(&model.key());
    let info = ctx.catalog.cache().get_file_info(&model_path);

    println!("{model}");
    println!("  size: {}", format_size(info.size));
    for field in RecordField::all() {
        let value = record.field(*field);
        if !value.is_empty() {
            println!("  {}: {}", field.slug(), value);
        }
    }
    println!("  favorite: {}", record.is_favorite);
    if let Some(preview) = find_preview(&model_path) {
        println!("  preview: {}", preview.display());
    }
    Ok(())
}

fn fetch(
    ctx: &AppContext,
    key: &str,
    source: Source,
    url: Option<String>,
    replace_preview: bool,
) -> Result<()> {
    let model = ctx.resolve(key)?;
    let model_path = ctx.catalog.model_path(&model);
    let want_preview = preview_policy(replace_preview).wants_preview(find_preview(&model_path).is_some());
    let record = ctx.store.get(&model.key());

    let (source, fetched) = match source {
        Source::Civitai => {
            let hash = if record.hash.is_empty() {
                update_hash(
                    &ctx.store,
                    &ctx.library.root,
                    &model,
                    &CancellationToken::new(),
                    |_, _| {},
                )?
                .ok_or_else(|| anyhow!("hashing cancelled"))?
            } else {
                record.hash
            };
            let fetched = ctx
                .runtime
                .block_on(ctx.scraper.fetch_civitai(&hash, want_preview));
            (ScrapeSource::Civitai, fetched)
        }
        Source::Liblib => {
            let page = url.unwrap_or(record.url);
            let page = validate_page_url(&page)?.to_string();
            let fetched = ctx
                .runtime
                .block_on(ctx.scraper.fetch_liblib(&page, want_preview))
                .map(|mut result| {
                    result.source_url.get_or_insert(page);
                    result
                });
            (ScrapeSource::Liblib, fetched)
        }
    };

    let result = match fetched {
        Ok(result) => result,
        Err(ScrapeError::NotFound) => {
            println!("{} has nothing on {model}", source.label());
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let summary = commit(&ctx.store, &ctx.library.root, &model, source, &result)?;
    println!(
        "preview: {}, trigger words: {}, description: {}",
        summary.preview_saved, summary.trigger_words, summary.description
    );
    Ok(())
}
