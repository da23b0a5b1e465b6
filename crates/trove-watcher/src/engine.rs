//! Per-library runtime.
//!
//! [`LibraryEngine`] ties a backend, a crawler, the watch table and the
//! indexer together and enforces the concurrency rules:
//!
//! - one crawl at a time per library (the scan lock)
//! - watch changes arriving while a crawl runs are buffered and
//!   replayed once its results are in the index
//! - index mutation and watch table updates happen under one writer
//!   lock
//! - overflow schedules at most one pending full rescan

use crate::backend::{BackendRegistry, RawEvent, RawSink, SourceBackend, WatchHandle};
use crate::crawler::{CancelFlag, Crawler, Probe, ScanError, ScanStats};
use crate::events::{FileChange, WatchChange};
use crate::indexer::{ApplyReport, Indexer};
use crate::signals::SignalBus;
use crate::watcher::Watcher;
use chrono::Utc;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trove_core::{
    ConfigError, EngineSettings, FileRecord, LibraryConfig, LibraryId, LibraryStatus, SourceError,
};
use trove_store::{IndexStore, IndexView, StoreError};

const WATCH_QUEUE: usize = 4096;

/// Outcome of one crawl.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub stats: ScanStats,
    pub applied: ApplyReport,
    pub purged: usize,
    pub duration: Duration,
}

/// Raw notifications for one library, as returned by
/// [`LibraryEngine::start_watching`].
pub struct WatchStream {
    events: mpsc::Receiver<RawEvent>,
    sink: RawSink,
}

struct Writer {
    indexer: Indexer,
    watcher: Watcher,
}

#[derive(Default)]
struct Gate {
    /// Crawls started and not yet finished replaying.
    scans: usize,
    buffered: Vec<WatchChange>,
    rescan_pending: bool,
}

struct Inner {
    config: LibraryConfig,
    settings: EngineSettings,
    crawler: Crawler,
    store: IndexStore,
    writer: tokio::sync::Mutex<Writer>,
    gate: Mutex<Gate>,
    scan_lock: tokio::sync::Mutex<()>,
    cancel: CancelFlag,
    rescans: AtomicUsize,
}

/// Scanning and watching for one library. Cheap to clone.
#[derive(Clone)]
pub struct LibraryEngine {
    inner: Arc<Inner>,
}

impl LibraryEngine {
    pub fn new(
        config: LibraryConfig,
        settings: EngineSettings,
        backend: Arc<dyn SourceBackend>,
        store: IndexStore,
        bus: Arc<SignalBus>,
    ) -> Self {
        let indexer = Indexer::new(config.id.clone(), config.context.clone(), store.clone(), bus);
        Self {
            inner: Arc::new(Inner {
                crawler: Crawler::new(backend, settings.clone()),
                writer: tokio::sync::Mutex::new(Writer {
                    indexer,
                    watcher: Watcher::detached(),
                }),
                gate: Mutex::new(Gate::default()),
                scan_lock: tokio::sync::Mutex::new(()),
                cancel: CancelFlag::new(),
                rescans: AtomicUsize::new(0),
                config,
                settings,
                store,
            }),
        }
    }

    /// Resolves the library's source through `registry`.
    pub fn from_config(
        config: LibraryConfig,
        settings: EngineSettings,
        registry: &BackendRegistry,
        store: IndexStore,
        bus: Arc<SignalBus>,
    ) -> Result<Self, ConfigError> {
        let backend = registry.build(&config.source, &settings)?;
        Ok(Self::new(config, settings, backend, store, bus))
    }

    pub fn id(&self) -> &LibraryId {
        &self.inner.config.id
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &IndexStore {
        &self.inner.store
    }

    pub fn status(&self) -> Result<LibraryStatus, StoreError> {
        self.inner.store.status(self.id())
    }

    fn backend(&self) -> &Arc<dyn SourceBackend> {
        self.inner.crawler.backend()
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.inner.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops any running crawl at its next batch boundary. Later
    /// crawls fail immediately until [`resume`](Self::resume).
    pub fn cancel(&self) {
        info!("Cancelling scans of {}", self.id());
        self.inner.cancel.cancel();
    }

    pub fn resume(&self) {
        self.inner.cancel.reset();
    }

    /// Full rescans scheduled by overflow so far.
    pub fn rescans_scheduled(&self) -> usize {
        self.inner.rescans.load(Ordering::SeqCst)
    }

    pub fn rescan_pending(&self) -> bool {
        self.gate().rescan_pending
    }

    /// Runs one full crawl to completion, then replays watch changes
    /// that arrived meanwhile.
    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        self.gate().scans += 1;
        let guard = self.inner.scan_lock.lock().await;

        let result = self.full_scan().await;

        loop {
            let changes = {
                let mut gate = self.gate();
                if gate.buffered.is_empty() {
                    gate.scans -= 1;
                    break;
                }
                mem::take(&mut gate.buffered)
            };
            debug!("Replaying {} buffered watch changes", changes.len());
            if let Err(e) = self.process_watch_changes(changes).await {
                warn!("Replaying watch changes for {} failed: {}", self.id(), e);
            }
        }
        drop(guard);
        result
    }

    /// Crawls one directory of the library.
    pub async fn scan_scope(&self, dir: &str) -> Result<ScanReport, ScanError> {
        let _guard = self.inner.scan_lock.lock().await;
        let started = Instant::now();
        let (stats, applied) = self.crawl(dir).await?;
        Ok(ScanReport {
            stats,
            applied,
            purged: 0,
            duration: started.elapsed(),
        })
    }

    async fn full_scan(&self) -> Result<ScanReport, ScanError> {
        let started = Instant::now();
        let library = self.id().clone();
        info!("Scanning library {}", library);

        let (stats, applied) = match self.crawl("").await {
            Ok(done) => done,
            Err(e) => {
                warn!("Scan of {} failed: {}", library, e);
                self.inner
                    .store
                    .update_status(&library, |s| s.last_error = Some(e.to_string()))?;
                return Err(e);
            }
        };

        let coverage = self.refresh_watches().await;

        let purged = {
            let writer = self.inner.writer.lock().await;
            writer
                .indexer
                .purge_missing(Utc::now(), self.inner.settings.confirmation_window())?
        };

        let now = Utc::now();
        self.inner.store.update_status(&library, |s| {
            s.last_full_scan = Some(now);
            match &coverage {
                Ok(()) => {
                    s.watch_degraded = false;
                    s.degraded_since = None;
                    s.last_error = None;
                }
                Err(e) => s.last_error = Some(e.to_string()),
            }
        })?;

        let report = ScanReport {
            stats,
            purged: purged.commit.files_removed,
            applied: {
                let mut applied = applied;
                applied.merge(purged);
                applied
            },
            duration: started.elapsed(),
        };
        info!(
            "Scanned {}: {} files, {} hashed, {} removed, {} signals in {:?}",
            library,
            report.stats.files_seen,
            report.stats.hashed,
            report.stats.removed,
            report.applied.signals.len(),
            report.duration
        );
        Ok(report)
    }

    async fn crawl(&self, scope: &str) -> Result<(ScanStats, ApplyReport), ScanError> {
        let cancel = &self.inner.cancel;
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let known = self.inner.store.files(self.id())?;
        let mut pass = self.inner.crawler.start(scope, known).await?;

        let mut applied = ApplyReport::default();
        let removals = pass.removals();
        applied.merge(self.inner.writer.lock().await.indexer.apply(removals)?);

        while !pass.is_done() {
            let changes = pass.next_batch(cancel).await?;
            let writer = self.inner.writer.lock().await;
            applied.merge(writer.indexer.apply(changes)?);
        }
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let vanished = pass.removals();
        let writer = self.inner.writer.lock().await;
        applied.merge(writer.indexer.apply(vanished)?);
        Ok((pass.stats(), applied))
    }

    /// Rebuilds watch coverage after it was lost.
    async fn refresh_watches(&self) -> Result<(), SourceError> {
        let degraded = self.status().map(|s| s.watch_degraded).unwrap_or(true);
        let mut writer = self.inner.writer.lock().await;
        if !writer.watcher.is_live() || !degraded {
            return Ok(());
        }
        writer.watcher.deregister_subtree("");
        writer
            .watcher
            .register_subtree(self.backend().as_ref(), "")
            .map(|_| ())
    }

    fn mark_degraded(&self, reason: &str) {
        warn!("Watch coverage of {} degraded: {}", self.id(), reason);
        let now = Utc::now();
        let result = self.inner.store.update_status(self.id(), |s| {
            if !s.watch_degraded {
                s.degraded_since = Some(now);
            }
            s.watch_degraded = true;
            s.last_error = Some(reason.to_string());
        });
        if let Err(e) = result {
            warn!("Failed to record degraded state of {}: {}", self.id(), e);
        }
    }

    /// Registers watches for the whole library in the current watcher.
    pub async fn register_watches(&self) -> Result<usize, ScanError> {
        let mut writer = self.inner.writer.lock().await;
        match writer.watcher.register_subtree(self.backend().as_ref(), "") {
            Ok(count) => Ok(count),
            Err(e) => {
                self.mark_degraded(&e.to_string());
                Err(ScanError::Backend(e))
            }
        }
    }

    /// The handle a directory is watched under, if any.
    pub async fn watch_handle(&self, dir: &str) -> Option<WatchHandle> {
        self.inner.writer.lock().await.watcher.table().handle_of(dir)
    }

    /// Starts live notifications. Returns `None` when the backend
    /// cannot watch; the library then runs scan-only.
    pub async fn start_watching(&self) -> Result<Option<WatchStream>, ScanError> {
        let (sink, events) = RawSink::channel(WATCH_QUEUE);
        let primitive = match self.backend().watch(sink.clone()) {
            Ok(primitive) => primitive,
            Err(SourceError::Unsupported(kind)) => {
                info!("The {} backend cannot watch, {} is scan-only", kind, self.id());
                return Ok(None);
            }
            Err(e) => {
                self.mark_degraded(&e.to_string());
                return Err(ScanError::Backend(e));
            }
        };

        self.inner.writer.lock().await.watcher = Watcher::new(primitive);
        let count = self.register_watches().await?;
        info!("Watching {} directories of {}", count, self.id());
        Ok(Some(WatchStream { events, sink }))
    }

    /// Runs the watch loop until `shutdown` resolves or the stream ends.
    pub async fn run_watch<F>(&self, mut stream: WatchStream, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let purge_every = (self.inner.settings.confirmation_window() / 4).max(Duration::from_secs(1));
        let mut purge_tick = tokio::time::interval(purge_every);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = purge_tick.tick() => {
                    if let Err(e) = self.purge().await {
                        warn!("Purge of {} failed: {}", self.id(), e);
                    }
                }
                first = stream.events.recv() => {
                    let Some(first) = first else { break };
                    let mut batch = vec![first];
                    // Give the other half of a rename time to arrive
                    tokio::time::sleep(self.inner.settings.rename_window()).await;
                    while let Ok(event) = stream.events.try_recv() {
                        batch.push(event);
                    }
                    if stream.sink.take_overflow() {
                        batch.push(RawEvent::Overflow);
                    }

                    if let Err(e) = self.handle_raw_batch(batch).await {
                        warn!("Watch batch for {} failed: {}", self.id(), e);
                    }
                    if self.rescan_pending() {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.run_pending_rescan().await {
                                warn!("Rescan of {} failed: {}", engine.id(), e);
                            }
                        });
                    }
                }
            }
        }
        info!("Stopped watching {}", self.id());
    }

    /// Normalizes one batch of raw notifications and handles it.
    pub async fn handle_raw_batch(&self, batch: Vec<RawEvent>) -> Result<ApplyReport, ScanError> {
        let changes = self.inner.writer.lock().await.watcher.normalize(batch);
        self.handle_watch_changes(changes).await
    }

    /// Handles normalized watch changes, or buffers them while a crawl
    /// is running.
    pub async fn handle_watch_changes(
        &self,
        changes: Vec<WatchChange>,
    ) -> Result<ApplyReport, ScanError> {
        let (overflow, changes): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .partition(|c| matches!(c, WatchChange::Overflow));
        if !overflow.is_empty() {
            self.schedule_rescan();
        }
        if changes.is_empty() {
            return Ok(ApplyReport::default());
        }

        {
            let mut gate = self.gate();
            if gate.scans > 0 {
                debug!("Buffering {} watch changes during scan", changes.len());
                gate.buffered.extend(changes);
                return Ok(ApplyReport::default());
            }
        }

        let _guard = self.inner.scan_lock.lock().await;
        self.process_watch_changes(changes).await
    }

    /// Marks the library degraded and schedules one full rescan.
    /// Returns `false` if one was already pending.
    pub fn schedule_rescan(&self) -> bool {
        {
            let mut gate = self.gate();
            if gate.rescan_pending {
                return false;
            }
            gate.rescan_pending = true;
        }
        self.inner.rescans.fetch_add(1, Ordering::SeqCst);
        self.mark_degraded("watch notifications were dropped");
        info!("Scheduled a full rescan of {}", self.id());
        true
    }

    /// Runs the scheduled rescan, if any.
    pub async fn run_pending_rescan(&self) -> Result<Option<ScanReport>, ScanError> {
        {
            let mut gate = self.gate();
            if !gate.rescan_pending {
                return Ok(None);
            }
            gate.rescan_pending = false;
        }
        self.scan().await.map(Some)
    }

    /// Purges files missing for longer than the confirmation window,
    /// unless a crawl is running.
    pub async fn purge(&self) -> Result<ApplyReport, ScanError> {
        let Ok(_guard) = self.inner.scan_lock.try_lock() else {
            return Ok(ApplyReport::default());
        };
        let writer = self.inner.writer.lock().await;
        Ok(writer
            .indexer
            .purge_missing(Utc::now(), self.inner.settings.confirmation_window())?)
    }

    async fn flush(
        &self,
        pending: &mut Vec<FileChange>,
        report: &mut ApplyReport,
    ) -> Result<(), ScanError> {
        if pending.is_empty() {
            return Ok(());
        }
        let writer = self.inner.writer.lock().await;
        report.merge(writer.indexer.apply(mem::take(pending))?);
        Ok(())
    }

    async fn probe(&self, path: &str, pending: &mut Vec<FileChange>, report: &mut ApplyReport) -> Result<(), ScanError> {
        let known = self.inner.store.file(self.id(), path)?;
        self.probe_against(path, known.as_ref(), pending, report).await
    }

    /// Probes `path`, comparing what is on disk with `known`.
    async fn probe_against(
        &self,
        path: &str,
        known: Option<&FileRecord>,
        pending: &mut Vec<FileChange>,
        report: &mut ApplyReport,
    ) -> Result<(), ScanError> {
        match self.inner.crawler.probe(path, known).await {
            Probe::Changed(change) => pending.push(change),
            Probe::Directory => {
                self.flush(pending, report).await?;
                self.directory_created(path, report).await?;
            }
            Probe::Unchanged | Probe::Skipped => {}
        }
        Ok(())
    }

    async fn directory_created(&self, dir: &str, report: &mut ApplyReport) -> Result<(), ScanError> {
        if self.backend().is_ignored(dir) {
            debug!("Ignoring new directory '{}'", dir);
            return Ok(());
        }
        let registered = {
            let mut writer = self.inner.writer.lock().await;
            writer.watcher.register_subtree(self.backend().as_ref(), dir)
        };
        if let Err(e) = registered {
            warn!("Cannot watch '{}': {}", dir, e);
            self.schedule_rescan();
        }
        let (_, applied) = self.crawl(dir).await?;
        report.merge(applied);
        Ok(())
    }

    /// Whether a rename away from `from` carries an available file.
    ///
    /// Returns the stored record to compare the destination against, or
    /// `Some(None)` when the file only exists in `pending` so far. `None`
    /// means there is nothing to move and the destination must be probed
    /// as a new file.
    fn move_source(
        &self,
        from: &str,
        pending: &[FileChange],
    ) -> Result<Option<Option<FileRecord>>, ScanError> {
        for change in pending.iter().rev() {
            match change {
                FileChange::Moved { from: moved, .. } if moved == from => return Ok(None),
                _ if change.path() != from => continue,
                FileChange::Removed { .. } | FileChange::DirectoryRemoved { .. } => return Ok(None),
                _ => return Ok(Some(None)),
            }
        }
        Ok(self
            .inner
            .store
            .file(self.id(), from)?
            .filter(|record| record.is_available())
            .map(Some))
    }

    /// Turns watch changes into file changes and applies them in order.
    /// Callers hold the scan lock.
    async fn process_watch_changes(&self, changes: Vec<WatchChange>) -> Result<ApplyReport, ScanError> {
        let mut report = ApplyReport::default();
        let mut pending = Vec::new();

        for change in changes {
            match change {
                WatchChange::Created(path) | WatchChange::Modified(path) => {
                    self.probe(&path, &mut pending, &mut report).await?;
                }
                WatchChange::Deleted(path) => pending.push(FileChange::Removed { path }),
                WatchChange::Moved { from, to } => {
                    if self.backend().is_ignored(&to) {
                        pending.push(FileChange::Removed { path: from });
                        continue;
                    }
                    match self.move_source(&from, &pending)? {
                        Some(source) => {
                            pending.push(FileChange::Moved { from, to: to.clone() });
                            // The content may have changed before the rename
                            self.probe_against(&to, source.as_ref(), &mut pending, &mut report)
                                .await?;
                        }
                        None => self.probe(&to, &mut pending, &mut report).await?,
                    }
                }
                WatchChange::DirCreated(path) => {
                    self.flush(&mut pending, &mut report).await?;
                    self.directory_created(&path, &mut report).await?;
                }
                WatchChange::DirRemoved(path) => {
                    self.inner.writer.lock().await.watcher.deregister_subtree(&path);
                    pending.push(FileChange::DirectoryRemoved { path });
                }
                WatchChange::DirMoved { from, to } => {
                    self.inner.writer.lock().await.watcher.deregister_subtree(&from);
                    if self.backend().is_ignored(&to) {
                        pending.push(FileChange::DirectoryRemoved { path: from });
                    } else {
                        pending.push(FileChange::DirectoryMoved { from, to: to.clone() });
                        self.flush(&mut pending, &mut report).await?;
                        // Picks up anything the old location was hiding
                        self.directory_created(&to, &mut report).await?;
                    }
                }
                WatchChange::Overflow => {
                    self.schedule_rescan();
                }
            }
        }
        self.flush(&mut pending, &mut report).await?;
        Ok(report)
    }
}
