//! CLI command implementations.

use crate::handlers::{GalleryHandler, GALLERY};
use crate::original::OriginalRenditions;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use trove_cache::{RenditionCache, RenditionInvalidator, RenditionSpec};
use trove_core::{
    AssetId, AssetState, FileState, LibraryConfig, LibraryId, SourceUri, TroveConfig,
};
use trove_store::IndexStore;
use trove_watcher::{
    BackendRegistry, LibraryEngine, ScanReport, SignalBus, SignalKind, SourceBackend,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("no config at {0}; run `trove init` first")]
    NotInitialized(PathBuf),

    #[error("config already exists at {0} (use --force to overwrite)")]
    AlreadyInitialized(PathBuf),

    #[error("unknown library '{0}'")]
    UnknownLibrary(String),

    #[error("library '{0}' already exists")]
    DuplicateLibrary(String),

    #[error("no enabled libraries to work on")]
    NoLibraries,

    #[error("{0} of {1} libraries failed")]
    LibrariesFailed(usize, usize),

    #[error("invalid asset id '{0}'")]
    InvalidAsset(String),
}

/// Everything a command needs once the config is loaded.
struct Runtime {
    store: IndexStore,
    cache: RenditionCache,
    engines: Vec<LibraryEngine>,
    /// Libraries whose source could not be set up, with the reason.
    broken: Vec<(LibraryId, String)>,
}

fn load_config(config_path: &Path) -> Result<TroveConfig> {
    if !config_path.exists() {
        return Err(CliError::NotInitialized(config_path.to_path_buf()).into());
    }
    Ok(TroveConfig::load(config_path)?)
}

/// Libraries a command should touch: the named one, or every enabled
/// one.
fn select<'a>(config: &'a TroveConfig, library: Option<&str>) -> Result<Vec<&'a LibraryConfig>> {
    match library {
        Some(id) => config
            .library(id)
            .map(|l| vec![l])
            .ok_or_else(|| CliError::UnknownLibrary(id.to_string()).into()),
        None => Ok(config.libraries.iter().filter(|l| l.enabled).collect()),
    }
}

fn build_bus(libraries: &[&LibraryConfig], cache: &RenditionCache) -> SignalBus {
    let mut bus = SignalBus::new();
    let contexts: BTreeSet<&str> = libraries.iter().map(|l| l.context.as_str()).collect();
    let invalidator = Arc::new(RenditionInvalidator::new(cache.clone()));

    for context in contexts {
        if context == GALLERY {
            bus.register_all(context, Arc::new(GalleryHandler));
        } else {
            warn!(
                "No handlers for context '{}'; its files are indexed but never claimed",
                context
            );
        }
        bus.register(context, SignalKind::FileAvailable, invalidator.clone());
        bus.register(context, SignalKind::AssetRemoved, invalidator.clone());
    }
    bus
}

fn open_runtime(config: &TroveConfig, library: Option<&str>) -> Result<Runtime> {
    let selected = select(config, library)?;
    let store = IndexStore::open(&config.database)?;
    let registry = BackendRegistry::new();

    let mut backends: HashMap<LibraryId, Arc<dyn SourceBackend>> = HashMap::new();
    let mut broken = Vec::new();
    for lib in &selected {
        match registry.build(&lib.source, &config.settings) {
            Ok(backend) => {
                backends.insert(lib.id.clone(), backend);
            }
            Err(e) => broken.push((lib.id.clone(), e.to_string())),
        }
    }

    let cache = RenditionCache::open(
        store.clone(),
        Arc::new(OriginalRenditions::new(backends.clone())),
    )?;
    let bus = Arc::new(build_bus(&selected, &cache));

    let engines = selected
        .iter()
        .filter_map(|lib| {
            let backend = backends.get(&lib.id)?;
            Some(LibraryEngine::new(
                (*lib).clone(),
                config.settings.clone(),
                Arc::clone(backend),
                store.clone(),
                Arc::clone(&bus),
            ))
        })
        .collect();

    Ok(Runtime {
        store,
        cache,
        engines,
        broken,
    })
}

fn report_broken(broken: &[(LibraryId, String)]) {
    for (id, reason) in broken {
        println!("{} {} {}", "✗".red(), id.to_string().bold(), reason.red());
    }
}

/// Write a starter config, optionally with a first library.
pub fn init(config_path: &Path, root: Option<&Path>, id: &str, context: &str, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(CliError::AlreadyInitialized(config_path.to_path_buf()).into());
    }

    let mut config = TroveConfig::starter(config_path);
    if let Some(root) = root {
        let root = std::fs::canonicalize(root)?;
        config
            .libraries
            .push(LibraryConfig::new(id, SourceUri::file(root), context));
    }
    config.save(config_path)?;

    println!("{} Wrote {}", "✓".green(), config_path.display());
    if config.libraries.is_empty() {
        println!("  Run {} to add a library", "trove add <id> <source>".cyan());
    } else {
        println!("  Run {} to index it", "trove scan".cyan());
    }
    Ok(())
}

/// Add a library to an existing config.
pub fn add(config_path: &Path, id: &str, source: &str, context: &str) -> Result<()> {
    let mut config = load_config(config_path)?;
    if config.library(id).is_some() {
        return Err(CliError::DuplicateLibrary(id.to_string()).into());
    }

    // Bare paths are taken as filesystem roots
    let source: SourceUri = if source.contains("://") {
        source.parse()?
    } else {
        SourceUri::file(std::fs::canonicalize(source)?)
    };
    BackendRegistry::new().build(&source, &config.settings)?;

    println!("{} Added {} ({}, context {})", "✓".green(), id.bold(), source, context.cyan());
    config.libraries.push(LibraryConfig::new(id, source, context));
    config.save(config_path)?;
    Ok(())
}

fn print_scan(engine: &LibraryEngine, report: &ScanReport) {
    let stats = &report.stats;
    println!(
        "{} {} {} files ({} hashed, {} unchanged, {} removed) in {}ms",
        "✓".green(),
        engine.id().to_string().bold(),
        stats.files_seen.to_string().cyan(),
        stats.hashed,
        stats.unchanged,
        stats.removed,
        report.duration.as_millis()
    );
    let signals = &report.applied;
    if !signals.signals.is_empty() {
        println!(
            "  {} available, {} moved, {} unavailable, {} orphaned, {} removed",
            signals.count(SignalKind::FileAvailable),
            signals.count(SignalKind::FileMoved),
            signals.count(SignalKind::FileUnavailable),
            signals.count(SignalKind::AssetOrphaned),
            signals.count(SignalKind::AssetRemoved),
        );
    }
    if stats.errors > 0 {
        println!(
            "  {} {} files could not be read and will be retried",
            "⚠".yellow(),
            stats.errors
        );
    }
    if signals.handler_failures > 0 {
        println!(
            "  {} {} handler failures, affected files are queued for re-evaluation",
            "⚠".yellow(),
            signals.handler_failures
        );
    }
}

/// Run one full scan of each selected library.
pub async fn scan(config_path: &Path, library: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let runtime = open_runtime(&config, library)?;
    report_broken(&runtime.broken);

    let total = runtime.engines.len() + runtime.broken.len();
    let mut failed = runtime.broken.len();

    for engine in &runtime.engines {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner.set_message(format!("Scanning {}...", engine.id()));

        let result = engine.scan().await;
        spinner.finish_and_clear();

        match result {
            Ok(report) => print_scan(engine, &report),
            Err(e) => {
                failed += 1;
                println!("{} {} {}", "✗".red(), engine.id().to_string().bold(), e.to_string().red());
            }
        }
    }

    runtime.store.flush()?;
    if failed > 0 {
        return Err(CliError::LibrariesFailed(failed, total).into());
    }
    Ok(())
}

async fn poll(engine: LibraryEngine, every: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => match engine.scan().await {
                Ok(report) => print_scan(&engine, &report),
                Err(e) => println!("{} {} {}", "✗".red(), engine.id().to_string().bold(), e.to_string().red()),
            },
        }
    }
}

async fn watch_library(
    engine: LibraryEngine,
    interval: Option<Duration>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if let Some(every) = interval {
        return poll(engine, every, shutdown).await;
    }

    let stream = match engine.start_watching().await {
        Ok(Some(stream)) => stream,
        Ok(None) => return poll(engine, FALLBACK_POLL, shutdown).await,
        Err(e) => {
            println!(
                "{} {} cannot watch ({}), polling instead",
                "⚠".yellow(),
                engine.id().to_string().bold(),
                e
            );
            return poll(engine, FALLBACK_POLL, shutdown).await;
        }
    };

    let watcher = {
        let engine = engine.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            engine
                .run_watch(stream, async move {
                    let _ = shutdown.changed().await;
                })
                .await;
        })
    };

    // Catch up on whatever changed while nobody was watching
    match engine.scan().await {
        Ok(report) => print_scan(&engine, &report),
        Err(e) => println!("{} {} {}", "✗".red(), engine.id().to_string().bold(), e.to_string().red()),
    }
    println!("{} Watching {}", "👁".cyan(), engine.id().to_string().bold());

    if let Err(e) = watcher.await {
        warn!("Watch task of {} ended abnormally: {}", engine.id(), e);
    }
}

const FALLBACK_POLL: Duration = Duration::from_secs(60);

/// Keep selected libraries in sync until interrupted.
pub async fn watch(config_path: &Path, library: Option<&str>, interval: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    let runtime = open_runtime(&config, library)?;
    report_broken(&runtime.broken);
    if runtime.engines.is_empty() {
        return Err(CliError::NoLibraries.into());
    }

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let interval = interval.map(Duration::from_secs);
    let mut tasks = Vec::new();
    for engine in runtime.engines {
        tasks.push(tokio::spawn(watch_library(engine, interval, shutdown.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = stop.send(true);
    for task in tasks {
        task.await?;
    }

    runtime.store.flush()?;
    println!("{} Stopped", "✓".green());
    Ok(())
}

#[derive(Debug, Serialize)]
struct LibrarySummary {
    id: String,
    source: String,
    context: String,
    enabled: bool,
    available_files: usize,
    missing_files: usize,
    claimed_assets: usize,
    orphaned_assets: usize,
    watch_degraded: bool,
    last_full_scan: Option<String>,
    last_error: Option<String>,
}

/// Show what the index knows about each library.
pub fn status(config_path: &Path, library: Option<&str>, show_files: bool, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let selected: Vec<&LibraryConfig> = match library {
        Some(_) => select(&config, library)?,
        None => config.libraries.iter().collect(),
    };
    let store = IndexStore::open(&config.database)?;

    let mut summaries = Vec::new();
    for lib in &selected {
        let files = store.files(&lib.id)?;
        let assets = store.assets(&lib.id)?;
        let status = store.status(&lib.id)?;
        summaries.push((
            LibrarySummary {
                id: lib.id.to_string(),
                source: lib.source.to_string(),
                context: lib.context.clone(),
                enabled: lib.enabled,
                available_files: files.values().filter(|f| f.is_available()).count(),
                missing_files: files.values().filter(|f| f.state == FileState::Missing).count(),
                claimed_assets: assets.iter().filter(|a| a.state == AssetState::Claimed).count(),
                orphaned_assets: assets.iter().filter(|a| a.state == AssetState::Orphaned).count(),
                watch_degraded: status.watch_degraded,
                last_full_scan: status.last_full_scan.map(|t| t.to_rfc3339()),
                last_error: status.last_error,
            },
            files,
        ));
    }

    if json {
        let out: Vec<&LibrarySummary> = summaries.iter().map(|(s, _)| s).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "📊 Trove Status".cyan().bold());
    if summaries.is_empty() {
        println!();
        println!("  No libraries configured. Run {} to add one.", "trove add".cyan());
    }

    for (summary, files) in &summaries {
        println!();
        let marker = if summary.watch_degraded {
            "⚠".yellow()
        } else {
            "●".green()
        };
        println!("{} {} {}", marker, summary.id.bold(), summary.source.dimmed());
        if !summary.enabled {
            println!("  {}", "(disabled)".dimmed());
        }
        println!("  {} {}", "Context:".dimmed(), summary.context);
        println!(
            "  {} {} available, {} missing",
            "Files:".dimmed(),
            summary.available_files,
            summary.missing_files
        );
        println!(
            "  {} {} claimed, {} orphaned",
            "Assets:".dimmed(),
            summary.claimed_assets,
            summary.orphaned_assets
        );
        println!(
            "  {} {}",
            "Last full scan:".dimmed(),
            summary.last_full_scan.as_deref().unwrap_or("never")
        );
        if summary.watch_degraded {
            println!("  {} a full rescan is due", "Watch degraded:".yellow());
        }
        if let Some(error) = &summary.last_error {
            println!("  {} {}", "Last error:".dimmed(), error.red());
        }

        if show_files {
            let mut paths: Vec<_> = files.values().collect();
            paths.sort_by(|a, b| a.path.cmp(&b.path));
            for file in paths.iter().take(50) {
                let line = format!("{}  {}", &file.hash.to_hex()[..12], file.path);
                if file.is_available() {
                    println!("    {}", line);
                } else {
                    println!("    {} {}", line.dimmed(), "(missing)".dimmed());
                }
            }
            if paths.len() > 50 {
                println!("    ... and {} more", paths.len() - 50);
            }
        }
    }

    Ok(())
}

/// Write a rendition of an asset to a file.
pub async fn render(config_path: &Path, asset: &str, spec: &str, output: &Path) -> Result<()> {
    let asset: AssetId = asset
        .parse()
        .map_err(|_| CliError::InvalidAsset(asset.to_string()))?;
    let config = load_config(config_path)?;
    let runtime = open_runtime(&config, None)?;

    let bytes = runtime
        .cache
        .get_or_render(asset, &RenditionSpec::new(spec))
        .await?;
    std::fs::write(output, bytes.as_slice())?;
    runtime.store.flush()?;

    println!(
        "{} Wrote {} bytes to {}",
        "✓".green(),
        bytes.len().to_string().cyan(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn configured(dir: &Path) -> PathBuf {
        let root = dir.join("photos");
        std::fs::create_dir_all(&root).unwrap();
        let config_path = dir.join("config").join("config.json");
        init(&config_path, Some(&root), "photos", GALLERY, false).unwrap();
        config_path
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let config_path = configured(dir.path());

        let err = init(&config_path, None, "x", GALLERY, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init(&config_path, None, "x", GALLERY, true).unwrap();
        assert!(load_config(&config_path).unwrap().libraries.is_empty());
    }

    #[test]
    fn test_add_rejects_duplicates_and_unknown_schemes() {
        let dir = tempdir().unwrap();
        let config_path = configured(dir.path());
        let other = dir.path().join("other");
        std::fs::create_dir_all(&other).unwrap();

        add(&config_path, "other", other.to_str().unwrap(), "docs").unwrap();
        assert!(add(&config_path, "other", other.to_str().unwrap(), "docs").is_err());
        assert!(add(&config_path, "remote", "s3://bucket/prefix", "docs").is_err());

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.libraries.len(), 2);
        assert_eq!(config.library("other").unwrap().context, "docs");
    }

    #[tokio::test]
    async fn test_scan_then_render_original() {
        let dir = tempdir().unwrap();
        let config_path = configured(dir.path());
        std::fs::write(dir.path().join("photos").join("a.jpg"), b"pixels").unwrap();

        scan(&config_path, None).await.unwrap();

        let config = load_config(&config_path).unwrap();
        let asset = {
            let store = IndexStore::open(&config.database).unwrap();
            let assets = store.assets(&LibraryId::new("photos")).unwrap();
            assert_eq!(assets.len(), 1);
            assets[0].id
        };

        let output = dir.path().join("out.jpg");
        render(&config_path, &asset.to_string(), "original", &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_unknown_library_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = configured(dir.path());

        let err = scan(&config_path, Some("nope")).await.unwrap_err();
        assert!(err.to_string().contains("unknown library"));
    }

    #[test]
    fn test_status_without_config() {
        let dir = tempdir().unwrap();
        let err = status(&dir.path().join("missing.json"), None, false, false).unwrap_err();
        assert!(err.to_string().contains("trove init"));
    }
}
