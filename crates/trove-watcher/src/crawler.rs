//! Tree walks.
//!
//! A crawl lists everything under a scope up front, reports every
//! previously available file the listing lacks as removed, and hashes
//! only what cheap metadata says has changed. Hashing runs on a
//! bounded pool of blocking tasks; everything else is sequential.

use crate::backend::{is_within, Entry, SourceBackend};
use crate::events::{DiscoveredFile, FileChange};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use trove_core::{ContentHash, ContentHasher, EngineSettings, FileRecord, SourceError};
use trove_store::StoreError;

#[derive(Error, Debug)]
pub enum ScanError {
    /// The source root could not be reached when the scan started.
    /// Nothing was applied.
    #[error("source root unavailable: {0}")]
    RootUnavailable(#[source] SourceError),

    /// Cancelled from outside. The batch in progress was discarded.
    #[error("scan cancelled")]
    Cancelled,

    #[error("index error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Backend(#[from] SourceError),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Shared cancellation switch for scans of one library.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for one crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_seen: usize,
    pub hashed: usize,
    /// Metadata matched the index, content was not read.
    pub unchanged: usize,
    pub removed: usize,
    /// Per-file failures. Those files keep their previous state and
    /// are retried by the next scan.
    pub errors: usize,
}

/// What a single-path probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Changed(FileChange),
    Unchanged,
    /// The path is a directory, not a file.
    Directory,
    /// The path could not be read right now.
    Skipped,
}

#[derive(Clone)]
pub struct Crawler {
    backend: Arc<dyn SourceBackend>,
    settings: EngineSettings,
}

impl Crawler {
    pub fn new(backend: Arc<dyn SourceBackend>, settings: EngineSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<dyn SourceBackend> {
        &self.backend
    }

    /// Checks the root, retrying transient failures with backoff.
    async fn check_root(&self) -> Result<(), SourceError> {
        let mut attempt = 1;
        loop {
            let backend = Arc::clone(&self.backend);
            let result = tokio::task::spawn_blocking(move || backend.check())
                .await
                .unwrap_or_else(|e| Err(SourceError::Unavailable(e.to_string())));
            match result {
                Err(e) if e.is_retryable() && attempt < self.settings.retry_attempts => {
                    debug!("Root check failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(self.settings.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Lists `scope` ("" for the whole source) and prepares a pass.
    ///
    /// `known` holds the indexed files of the library; only those
    /// inside `scope` matter. Fails with [`ScanError::RootUnavailable`]
    /// if the source root is not reachable.
    pub async fn start(
        &self,
        scope: &str,
        known: HashMap<String, FileRecord>,
    ) -> Result<CrawlPass, ScanError> {
        self.check_root().await.map_err(ScanError::RootUnavailable)?;

        let backend = Arc::clone(&self.backend);
        let start = scope.to_string();
        let listing = tokio::task::spawn_blocking(move || list_files(backend.as_ref(), &start))
            .await
            .map_err(|e| ScanError::Task(e.to_string()))??;

        info!(
            "Found {} files under '{}' ({} unreadable directories)",
            listing.files.len(),
            scope,
            listing.unreadable.len()
        );

        let known = known
            .into_iter()
            .filter(|(path, _)| is_within(path, scope))
            .collect();
        let listed = listing.files.iter().map(|e| e.path.clone()).collect();

        Ok(CrawlPass {
            crawler: self.clone(),
            scope: scope.to_string(),
            pending: listing.files.into(),
            known,
            listed,
            reported: HashSet::new(),
            unreadable: listing.unreadable,
            stats: ScanStats {
                errors: listing.errors,
                ..ScanStats::default()
            },
        })
    }

    /// Looks at a single path, as the watcher does for create and
    /// modify notifications.
    pub async fn probe(&self, path: &str, known: Option<&FileRecord>) -> Probe {
        if self.backend.is_ignored(path) {
            return Probe::Changed(FileChange::Removed {
                path: path.to_string(),
            });
        }

        let backend = Arc::clone(&self.backend);
        let target = path.to_string();
        let stat = tokio::task::spawn_blocking(move || backend.stat(&target))
            .await
            .unwrap_or_else(|e| Err(SourceError::Unavailable(e.to_string())));

        let entry = match stat {
            Ok(entry) if entry.is_dir() => return Probe::Directory,
            Ok(entry) => entry,
            Err(SourceError::NotFound(_)) => {
                return Probe::Changed(FileChange::Removed {
                    path: path.to_string(),
                })
            }
            Err(e) => {
                warn!("Cannot stat '{}': {}", path, e);
                return Probe::Skipped;
            }
        };

        if let Some(record) = known {
            if record.is_available() && record.metadata_matches(entry.size, entry.mtime_ns) {
                return Probe::Unchanged;
            }
        }

        match hash_with_retry(Arc::clone(&self.backend), entry.path.clone(), &self.settings).await {
            Ok(hash) => Probe::Changed(discovered(entry, hash)),
            Err(SourceError::NotFound(_)) => Probe::Changed(FileChange::Removed {
                path: path.to_string(),
            }),
            Err(e) => {
                warn!("Skipping '{}': {}", path, e);
                Probe::Skipped
            }
        }
    }
}

/// One crawl in progress.
pub struct CrawlPass {
    crawler: Crawler,
    scope: String,
    pending: VecDeque<Entry>,
    known: HashMap<String, FileRecord>,
    /// Files the listing found, minus those that vanished since.
    listed: HashSet<String>,
    reported: HashSet<String>,
    unreadable: Vec<String>,
    stats: ScanStats,
}

impl CrawlPass {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Processes the next `batch_size` listed files.
    ///
    /// Returns the changes in path order. On cancellation the hashing
    /// tasks already running are drained and their results dropped.
    pub async fn next_batch(&mut self, cancel: &CancelFlag) -> Result<Vec<FileChange>, ScanError> {
        let settings = &self.crawler.settings;
        let take = settings.batch_size.max(1).min(self.pending.len());
        let batch: Vec<Entry> = self.pending.drain(..take).collect();

        let permits = Arc::new(Semaphore::new(settings.hash_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut changes = Vec::new();

        for entry in batch {
            self.stats.files_seen += 1;

            if let Some(record) = self.known.get(&entry.path) {
                if record.is_available() && record.metadata_matches(entry.size, entry.mtime_ns) {
                    self.stats.unchanged += 1;
                    if record.needs_reevaluation {
                        changes.push(FileChange::Reevaluate {
                            path: entry.path.clone(),
                        });
                    }
                    continue;
                }
            }

            let backend = Arc::clone(&self.crawler.backend);
            let settings = settings.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (entry, Err(SourceError::Unavailable("hash pool closed".into())));
                };
                if cancel.is_cancelled() {
                    return (entry, Err(SourceError::Unavailable("cancelled".into())));
                }
                let result = hash_with_retry(backend, entry.path.clone(), &settings).await;
                (entry, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (entry, result) = joined.map_err(|e| ScanError::Task(e.to_string()))?;
            if cancel.is_cancelled() {
                continue;
            }
            match result {
                Ok(hash) => {
                    self.stats.hashed += 1;
                    changes.push(discovered(entry, hash));
                }
                Err(SourceError::NotFound(_)) => {
                    debug!("'{}' vanished before it could be hashed", entry.path);
                    self.listed.remove(&entry.path);
                }
                Err(e) => {
                    warn!("Skipping '{}': {}", entry.path, e);
                    self.stats.errors += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        changes.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(changes)
    }

    /// Available files the crawl did not find, not reported before.
    ///
    /// Called once before the batches, so content that moved while
    /// nobody was watching is missing by the time it is rediscovered,
    /// and once after them for files that vanished while hashing.
    /// Files below a directory that could not be listed are left
    /// alone; they are not known to be gone.
    pub fn removals(&mut self) -> Vec<FileChange> {
        let mut removed: Vec<String> = self
            .known
            .values()
            .filter(|record| record.is_available())
            .filter(|record| !self.listed.contains(&record.path))
            .filter(|record| !self.reported.contains(&record.path))
            .filter(|record| !self.unreadable.iter().any(|dir| is_within(&record.path, dir)))
            .map(|record| record.path.clone())
            .collect();
        removed.sort();
        self.stats.removed += removed.len();
        self.reported.extend(removed.iter().cloned());
        removed
            .into_iter()
            .map(|path| FileChange::Removed { path })
            .collect()
    }
}

struct Listing {
    files: Vec<Entry>,
    unreadable: Vec<String>,
    errors: usize,
}

fn list_files(backend: &dyn SourceBackend, scope: &str) -> Result<Listing, ScanError> {
    let mut listing = Listing {
        files: Vec::new(),
        unreadable: Vec::new(),
        errors: 0,
    };
    for item in backend.enumerate(scope) {
        match item {
            Ok(entry) if entry.is_dir() => {}
            Ok(entry) => listing.files.push(entry),
            Err(SourceError::NotFound(path)) => {
                debug!("'{}' vanished during the walk", path);
            }
            Err(SourceError::PermissionDenied(path)) => {
                warn!("Skipping '{}': permission denied", path);
                listing.errors += 1;
                listing.unreadable.push(path);
            }
            Err(SourceError::CorruptRead { path, source }) if !path.is_empty() => {
                warn!("Skipping '{}': {}", path, source);
                listing.errors += 1;
                listing.unreadable.push(path);
            }
            // Anything else means we cannot tell what we missed
            Err(e) => return Err(ScanError::Backend(e)),
        }
    }
    listing.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(listing)
}

fn discovered(entry: Entry, hash: ContentHash) -> FileChange {
    FileChange::Discovered(DiscoveredFile {
        path: entry.path,
        size: entry.size,
        mtime_ns: entry.mtime_ns,
        hash,
    })
}

fn hash_file(backend: &dyn SourceBackend, path: &str) -> Result<ContentHash, SourceError> {
    let reader = backend.open(path)?;
    let mut hasher = ContentHasher::new();
    hasher
        .consume(reader)
        .map_err(|e| SourceError::from_io(path, e))?;
    Ok(hasher.finish())
}

/// Hashes one file within the I/O budget.
///
/// Only `Unavailable` is retried here. A timed-out read is left for
/// the next scan; the blocking read itself cannot be interrupted and
/// finishes in the background.
async fn hash_with_retry(
    backend: Arc<dyn SourceBackend>,
    path: String,
    settings: &EngineSettings,
) -> Result<ContentHash, SourceError> {
    let mut attempt = 1;
    loop {
        let task_backend = Arc::clone(&backend);
        let task_path = path.clone();
        let task = tokio::task::spawn_blocking(move || hash_file(task_backend.as_ref(), &task_path));

        let result = match tokio::time::timeout(settings.io_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SourceError::Unavailable(format!("{}: {}", path, e))),
            Err(_) => Err(SourceError::Timeout(path.clone())),
        };

        match result {
            Err(SourceError::Unavailable(reason)) if attempt < settings.retry_attempts => {
                debug!("Retrying '{}' (attempt {}): {}", path, attempt, reason);
                tokio::time::sleep(settings.retry_backoff() * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemBackend;
    use std::fs;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;
    use trove_core::{FileState, LibraryId};

    fn crawler(root: &std::path::Path) -> Crawler {
        let settings = EngineSettings {
            batch_size: 2,
            hash_workers: 2,
            ..EngineSettings::default()
        };
        let backend = FileSystemBackend::new(root).ignore_marker(settings.ignore_marker.clone());
        Crawler::new(Arc::new(backend), settings)
    }

    async fn drain(pass: &mut CrawlPass) -> Vec<FileChange> {
        let cancel = CancelFlag::new();
        let mut all = Vec::new();
        while !pass.is_done() {
            all.extend(pass.next_batch(&cancel).await.unwrap());
        }
        all
    }

    fn indexed(path: &str, content: &[u8], entry: &Entry) -> FileRecord {
        let mut record = FileRecord::hashed(
            LibraryId::new("lib"),
            path,
            ContentHash::of_bytes(content),
            entry.size,
            entry.mtime_ns,
        );
        record.state = FileState::Indexed;
        record
    }

    #[tokio::test]
    async fn test_first_crawl_hashes_everything_in_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("sub/c.txt"), "c").unwrap();

        let crawler = crawler(dir.path());
        let mut pass = crawler.start("", HashMap::new()).await.unwrap();
        let changes = drain(&mut pass).await;

        let paths: Vec<_> = changes.iter().map(|c| c.path().to_string()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "sub/c.txt"]);
        match &changes[0] {
            FileChange::Discovered(file) => assert_eq!(file.hash, ContentHash::of_bytes(b"a")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pass.stats().hashed, 3);
        assert!(pass.removals().is_empty());
    }

    #[tokio::test]
    async fn test_matching_metadata_skips_hashing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let crawler = crawler(dir.path());
        let entry = crawler.backend().stat("a.txt").unwrap();

        let mut known = HashMap::new();
        // Recorded hash is deliberately wrong: a match must not re-read
        known.insert("a.txt".to_string(), indexed("a.txt", b"stale", &entry));

        let mut pass = crawler.start("", known).await.unwrap();
        let changes = drain(&mut pass).await;
        assert!(changes.is_empty());
        assert_eq!(pass.stats().unchanged, 1);
        assert_eq!(pass.stats().hashed, 0);
    }

    #[tokio::test]
    async fn test_needs_reevaluation_is_redelivered() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let crawler = crawler(dir.path());
        let entry = crawler.backend().stat("a.txt").unwrap();

        let mut record = indexed("a.txt", b"a", &entry);
        record.needs_reevaluation = true;
        let known = HashMap::from([("a.txt".to_string(), record)]);

        let mut pass = crawler.start("", known).await.unwrap();
        assert_eq!(
            drain(&mut pass).await,
            vec![FileChange::Reevaluate {
                path: "a.txt".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_unseen_files_are_removed_within_scope() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();
        fs::write(dir.path().join("keep/x.txt"), "x").unwrap();
        let crawler = crawler(dir.path());
        let entry = crawler.backend().stat("keep/x.txt").unwrap();

        let known = HashMap::from([
            ("keep/x.txt".to_string(), indexed("keep/x.txt", b"x", &entry)),
            ("keep/gone.txt".to_string(), indexed("keep/gone.txt", b"g", &entry)),
            ("other/y.txt".to_string(), indexed("other/y.txt", b"y", &entry)),
        ]);

        let mut pass = crawler.start("keep", known).await.unwrap();
        assert_eq!(
            pass.removals(),
            vec![FileChange::Removed {
                path: "keep/gone.txt".into()
            }]
        );
        drain(&mut pass).await;
        assert!(pass.removals().is_empty());
        assert_eq!(pass.stats().removed, 1);
    }

    #[tokio::test]
    async fn test_marked_directory_is_skipped() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("private")).unwrap();
        fs::write(dir.path().join("private/.troveignore"), "").unwrap();
        fs::write(dir.path().join("private/secret.txt"), "s").unwrap();
        fs::write(dir.path().join("public.txt"), "p").unwrap();

        let crawler = crawler(dir.path());
        let mut pass = crawler.start("", HashMap::new()).await.unwrap();
        let paths: Vec<_> = drain(&mut pass)
            .await
            .iter()
            .map(|c| c.path().to_string())
            .collect();
        assert_eq!(paths, vec!["public.txt"]);

        assert!(matches!(
            crawler.probe("private/secret.txt", None).await,
            Probe::Changed(FileChange::Removed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let crawler = crawler(&dir.path().join("nope"));
        let result = crawler.start("", HashMap::new()).await;
        assert!(matches!(result, Err(ScanError::RootUnavailable(_))));
    }

    #[tokio::test]
    async fn test_cancelled_batch_returns_nothing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let crawler = crawler(dir.path());
        let mut pass = crawler.start("", HashMap::new()).await.unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(pass.next_batch(&cancel).await, Err(ScanError::Cancelled)));
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let crawler = crawler(dir.path());

        match crawler.probe("a.txt", None).await {
            Probe::Changed(FileChange::Discovered(file)) => {
                assert_eq!(file.hash, ContentHash::of_bytes(b"hi"));
                assert_eq!(file.size, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(crawler.probe("sub", None).await, Probe::Directory);
        assert_eq!(
            crawler.probe("missing.txt", None).await,
            Probe::Changed(FileChange::Removed {
                path: "missing.txt".into()
            })
        );

        let entry = crawler.backend().stat("a.txt").unwrap();
        let record = indexed("a.txt", b"hi", &entry);
        assert_eq!(crawler.probe("a.txt", Some(&record)).await, Probe::Unchanged);
    }

    /// Delegates to a real directory, with scripted trouble.
    struct Troubled {
        inner: FileSystemBackend,
        slow: Option<(String, std::time::Duration)>,
        flaky: Option<String>,
        open_failures: AtomicU32,
        check_failures: AtomicU32,
        open_attempts: AtomicU32,
        check_attempts: AtomicU32,
    }

    impl Troubled {
        fn new(root: &std::path::Path) -> Self {
            Self {
                inner: FileSystemBackend::new(root),
                slow: None,
                flaky: None,
                open_failures: AtomicU32::new(0),
                check_failures: AtomicU32::new(0),
                open_attempts: AtomicU32::new(0),
                check_attempts: AtomicU32::new(0),
            }
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl SourceBackend for Troubled {
        fn kind(&self) -> &'static str {
            "troubled"
        }

        fn check(&self) -> Result<(), SourceError> {
            self.check_attempts.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.check_failures) {
                return Err(SourceError::Unavailable("share offline".into()));
            }
            self.inner.check()
        }

        fn enumerate<'a>(
            &'a self,
            start: &str,
        ) -> Box<dyn Iterator<Item = Result<Entry, SourceError>> + 'a> {
            self.inner.enumerate(start)
        }

        fn stat(&self, path: &str) -> Result<Entry, SourceError> {
            self.inner.stat(path)
        }

        fn open(&self, path: &str) -> Result<Box<dyn std::io::Read + Send>, SourceError> {
            if let Some((slow, delay)) = &self.slow {
                if slow == path {
                    std::thread::sleep(*delay);
                }
            }
            if self.flaky.as_deref() == Some(path) {
                self.open_attempts.fetch_add(1, Ordering::SeqCst);
                if take_failure(&self.open_failures) {
                    return Err(SourceError::Unavailable("stale handle".into()));
                }
            }
            self.inner.open(path)
        }
    }

    fn troubled_crawler(backend: Troubled, settings: EngineSettings) -> (Crawler, Arc<Troubled>) {
        let backend = Arc::new(backend);
        (Crawler::new(backend.clone(), settings), backend)
    }

    #[tokio::test]
    async fn test_slow_file_times_out_alone() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("slow.txt"), "new").unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();

        let mut backend = Troubled::new(dir.path());
        backend.slow = Some(("slow.txt".into(), std::time::Duration::from_millis(500)));
        let settings = EngineSettings {
            io_timeout_ms: 50,
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        };
        let (crawler, _) = troubled_crawler(backend, settings);

        // Indexed before, with other metadata, so it must be re-read
        let mut stale = crawler.backend().stat("slow.txt").unwrap();
        stale.size += 1;
        let known = HashMap::from([("slow.txt".to_string(), indexed("slow.txt", b"old", &stale))]);

        let mut pass = crawler.start("", known).await.unwrap();
        let changes = drain(&mut pass).await;

        let paths: Vec<_> = changes.iter().map(|c| c.path().to_string()).collect();
        assert_eq!(paths, vec!["a.txt", "z.txt"]);
        assert_eq!(pass.stats().errors, 1);
        assert_eq!(pass.stats().hashed, 2);
        // Still listed, so the old record is neither updated nor removed
        assert!(pass.removals().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_read_is_retried() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let mut backend = Troubled::new(dir.path());
        backend.flaky = Some("a.txt".into());
        backend.open_failures = AtomicU32::new(2);
        let settings = EngineSettings {
            retry_attempts: 3,
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        };
        let (crawler, backend) = troubled_crawler(backend, settings);

        let mut pass = crawler.start("", HashMap::new()).await.unwrap();
        let changes = drain(&mut pass).await;

        assert_eq!(backend.open_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pass.stats().errors, 0);
        match &changes[..] {
            [FileChange::Discovered(file)] => assert_eq!(file.hash, ContentHash::of_bytes(b"a")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let mut backend = Troubled::new(dir.path());
        backend.flaky = Some("a.txt".into());
        backend.open_failures = AtomicU32::new(5);
        let settings = EngineSettings {
            retry_attempts: 3,
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        };
        let (crawler, backend) = troubled_crawler(backend, settings);

        let mut pass = crawler.start("", HashMap::new()).await.unwrap();
        assert!(drain(&mut pass).await.is_empty());
        assert_eq!(backend.open_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pass.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_root_check_is_retried_before_giving_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let settings = EngineSettings {
            retry_attempts: 3,
            retry_backoff_ms: 1,
            ..EngineSettings::default()
        };

        let backend = Troubled::new(dir.path());
        backend.check_failures.store(2, Ordering::SeqCst);
        let (crawler, backend) = troubled_crawler(backend, settings.clone());
        assert!(crawler.start("", HashMap::new()).await.is_ok());
        assert_eq!(backend.check_attempts.load(Ordering::SeqCst), 3);

        let backend = Troubled::new(dir.path());
        backend.check_failures.store(10, Ordering::SeqCst);
        let (crawler, backend) = troubled_crawler(backend, settings);
        let result = crawler.start("", HashMap::new()).await;
        assert!(matches!(
            result,
            Err(ScanError::RootUnavailable(SourceError::Unavailable(_)))
        ));
        assert_eq!(backend.check_attempts.load(Ordering::SeqCst), 3);
    }
}
