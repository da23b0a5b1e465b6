//! Source backends.
//!
//! A backend gives uniform access to one storage location: list what
//! is there, read it, and (if it can) report changes as they happen.
//! Paths are always relative to the library root and `/`-separated.

use crate::fs::FileSystemBackend;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use trove_core::{ConfigError, EngineSettings, SourceError, SourceUri};

/// Whether an enumerated entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Cheap metadata for one object in a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Nanoseconds since the Unix epoch, 0 if the backend has no mtime.
    pub mtime_ns: i64,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Opaque identifier for one registered directory watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

/// What a raw notification says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Deleted,
    MovedFrom,
    MovedTo,
}

/// One backend notification, before normalization. Like inotify, it
/// only names the watch it arrived on plus an entry name inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub handle: WatchHandle,
    pub name: String,
    pub kind: RawKind,
    /// Directory flag if the backend knows it.
    pub is_dir: Option<bool>,
    /// Pairs the two halves of a rename.
    pub cookie: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Change(RawChange),
    /// The backend dropped notifications.
    Overflow,
}

/// Sending half of a watch stream.
///
/// Backends push from their own notification threads, so sends never
/// block. When the queue is full the event is dropped and the overflow
/// flag is raised instead; the watcher turns that into a rescan.
#[derive(Clone)]
pub struct RawSink {
    tx: mpsc::Sender<RawEvent>,
    overflowed: Arc<AtomicBool>,
}

impl RawSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                overflowed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn send(&self, event: RawEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Watch stream closed, dropping event");
            }
        }
    }

    /// Returns and clears the overflow flag.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::SeqCst)
    }
}

/// Flat, per-directory notification registration.
///
/// Recursion is built on top of this by the watcher, which registers
/// every subdirectory explicitly.
pub trait WatchPrimitive: Send {
    /// Starts watching the direct children of `dir`.
    fn add_watch(&mut self, dir: &str) -> Result<WatchHandle, SourceError>;

    fn remove_watch(&mut self, handle: WatchHandle) -> Result<(), SourceError>;
}

/// Uniform capability over a storage location.
pub trait SourceBackend: Send + Sync {
    /// Short name used in logs and error messages.
    fn kind(&self) -> &'static str;

    /// Fails if the root is not reachable right now.
    fn check(&self) -> Result<(), SourceError>;

    /// Lists everything under `start` (exclusive), recursively.
    fn enumerate<'a>(
        &'a self,
        start: &str,
    ) -> Box<dyn Iterator<Item = Result<Entry, SourceError>> + 'a>;

    fn stat(&self, path: &str) -> Result<Entry, SourceError>;

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, SourceError>;

    /// Whether `path` lies inside an excluded directory.
    fn is_ignored(&self, _path: &str) -> bool {
        false
    }

    /// Begins delivering raw notifications into `sink`. Backends that
    /// cannot watch keep the default, and their libraries run in
    /// scan-only mode.
    fn watch(&self, _sink: RawSink) -> Result<Box<dyn WatchPrimitive>, SourceError> {
        Err(SourceError::Unsupported(self.kind()))
    }
}

type BackendFactory =
    Box<dyn Fn(&SourceUri, &EngineSettings) -> Result<Arc<dyn SourceBackend>, ConfigError> + Send + Sync>;

/// Maps URI schemes to backend constructors.
///
/// Built once at startup; `file` is always present.
pub struct BackendRegistry {
    schemes: HashMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            schemes: HashMap::new(),
        };
        registry.register("file", |uri, settings| {
            let backend = FileSystemBackend::from_uri(uri, settings)?;
            Ok(Arc::new(backend) as Arc<dyn SourceBackend>)
        });
        registry
    }

    /// Adds (or replaces) the backend for `scheme`.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&SourceUri, &EngineSettings) -> Result<Arc<dyn SourceBackend>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.schemes
            .insert(scheme.to_ascii_lowercase(), Box::new(factory));
    }

    pub fn build(
        &self,
        uri: &SourceUri,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn SourceBackend>, ConfigError> {
        let factory = self
            .schemes
            .get(uri.scheme())
            .ok_or_else(|| ConfigError::UnknownScheme(uri.scheme().to_string()))?;
        factory(uri, settings)
    }
}

/// Joins a directory and an entry name into a relative path.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Whether `path` is `dir` itself or lies inside it.
pub fn is_within(path: &str, dir: &str) -> bool {
    dir.is_empty()
        || path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_within() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("photos/2024", "a.jpg"), "photos/2024/a.jpg");
        assert!(is_within("a/b/c", "a/b"));
        assert!(is_within("a/b", "a/b"));
        assert!(!is_within("a/bc", "a/b"));
        assert!(is_within("anything", ""));
    }

    #[test]
    fn test_registry_rejects_unknown_scheme() {
        let registry = BackendRegistry::new();
        let uri: SourceUri = "s3://bucket".parse().unwrap();
        let result = registry.build(&uri, &EngineSettings::default());
        assert!(matches!(result, Err(ConfigError::UnknownScheme(s)) if s == "s3"));
    }

    #[tokio::test]
    async fn test_sink_flags_overflow_when_full() {
        let (sink, mut rx) = RawSink::channel(1);
        sink.send(RawEvent::Overflow);
        sink.send(RawEvent::Overflow);
        assert!(sink.take_overflow());
        assert!(!sink.take_overflow());
        assert_eq!(rx.recv().await, Some(RawEvent::Overflow));
    }
}
