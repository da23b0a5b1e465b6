//! Local filesystem backend.
//!
//! Enumeration uses the `ignore` walker with its standard filters
//! switched off, so every file counts. Directories containing the
//! ignore marker are pruned, and directory identities are tracked so
//! symlink loops cannot recurse forever. Watching registers one flat
//! `notify` watch per directory.

use crate::backend::{
    Entry, EntryKind, RawChange, RawEvent, RawKind, RawSink, SourceBackend, WatchHandle,
    WatchPrimitive,
};
use ignore::WalkBuilder;
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tracing::{debug, trace, warn};
use trove_core::{ConfigError, EngineSettings, SourceError, SourceUri};

/// Serves a local directory tree.
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    root: PathBuf,
    follow_symlinks: bool,
    ignore_marker: Option<String>,
}

impl FileSystemBackend {
    /// Creates a backend rooted at `root`. The root is canonicalized
    /// when possible so notification paths line up with it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            follow_symlinks: false,
            ignore_marker: None,
        }
    }

    pub fn from_uri(uri: &SourceUri, settings: &EngineSettings) -> Result<Self, ConfigError> {
        let root = uri.file_path().ok_or_else(|| ConfigError::InvalidSource {
            uri: uri.to_string(),
            reason: "not a file:// source".to_string(),
        })?;
        Ok(Self::new(root)
            .follow_symlinks(settings.follow_symlinks)
            .ignore_marker(settings.ignore_marker.clone()))
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn ignore_marker(mut self, marker: Option<String>) -> Self {
        self.ignore_marker = marker;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn entry_from_metadata(path: String, meta: &fs::Metadata) -> Entry {
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Entry {
            path,
            kind: if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime_ns,
        }
    }
}

/// `abs` relative to `root`, `/`-separated. `None` if outside the root.
fn relative_to(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(unix)]
fn dir_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn dir_identity(path: &Path) -> Option<(u64, u64)> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let canonical = fs::canonicalize(path).ok()?;
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    Some((0, hasher.finish()))
}

fn is_loop(err: &ignore::Error) -> bool {
    match err {
        ignore::Error::Loop { .. } => true,
        ignore::Error::WithPath { err, .. }
        | ignore::Error::WithDepth { err, .. }
        | ignore::Error::WithLineNumber { err, .. } => is_loop(err),
        _ => false,
    }
}

fn walk_error(root: &Path, err: ignore::Error) -> Option<SourceError> {
    if is_loop(&err) {
        debug!("Skipping symlink loop: {}", err);
        return None;
    }
    let path = match &err {
        ignore::Error::WithPath { path, .. } => {
            relative_to(root, path).unwrap_or_else(|| path.display().to_string())
        }
        _ => String::new(),
    };
    Some(match err.io_error() {
        Some(io) => SourceError::from_io(path, std::io::Error::new(io.kind(), io.to_string())),
        None => SourceError::CorruptRead {
            path,
            source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
        },
    })
}

impl SourceBackend for FileSystemBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn check(&self) -> Result<(), SourceError> {
        let root = self.root.display().to_string();
        let meta = fs::metadata(&self.root).map_err(|e| SourceError::from_io(root.clone(), e))?;
        if !meta.is_dir() {
            return Err(SourceError::NotFound(root));
        }
        fs::read_dir(&self.root).map_err(|e| SourceError::from_io(root, e))?;
        Ok(())
    }

    fn enumerate<'a>(
        &'a self,
        start: &str,
    ) -> Box<dyn Iterator<Item = Result<Entry, SourceError>> + 'a> {
        let visited: Arc<Mutex<HashSet<(u64, u64)>>> = Arc::default();
        let marker = self.ignore_marker.clone();

        let mut builder = WalkBuilder::new(self.absolute(start));
        builder
            .standard_filters(false)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let path = entry.path();
                if !path.is_dir() {
                    return true;
                }
                if let Some(marker) = &marker {
                    if entry.depth() > 0 && path.join(marker).exists() {
                        trace!("Ignoring marked directory {}", path.display());
                        return false;
                    }
                }
                match dir_identity(path) {
                    Some(id) => match visited.lock() {
                        Ok(mut seen) => seen.insert(id),
                        Err(_) => true,
                    },
                    None => true,
                }
            });

        let follow = self.follow_symlinks;
        let root = self.root.clone();
        let walk = builder.build().filter_map(move |item| {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => return walk_error(&root, err).map(Err),
            };
            if entry.depth() == 0 || (!follow && entry.path_is_symlink()) {
                return None;
            }
            let rel = relative_to(&root, entry.path())?;
            match fs::metadata(entry.path()) {
                Ok(meta) => Some(Ok(FileSystemBackend::entry_from_metadata(rel, &meta))),
                Err(e) => Some(Err(SourceError::from_io(rel, e))),
            }
        });
        Box::new(walk)
    }

    fn stat(&self, path: &str) -> Result<Entry, SourceError> {
        let meta = fs::metadata(self.absolute(path)).map_err(|e| SourceError::from_io(path, e))?;
        Ok(Self::entry_from_metadata(path.to_string(), &meta))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, SourceError> {
        let file = fs::File::open(self.absolute(path)).map_err(|e| SourceError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn is_ignored(&self, path: &str) -> bool {
        let Some(marker) = &self.ignore_marker else {
            return false;
        };
        let mut dir = self.root.clone();
        let mut parts = path.split('/').peekable();
        while let Some(part) = parts.next() {
            dir.push(part);
            // The last component is the entry itself, not a parent,
            // unless it is a directory.
            if parts.peek().is_none() && !dir.is_dir() {
                break;
            }
            if dir.join(marker).exists() {
                return true;
            }
        }
        false
    }

    fn watch(&self, sink: RawSink) -> Result<Box<dyn WatchPrimitive>, SourceError> {
        let handles: Arc<Mutex<DirHandles>> = Arc::default();
        let callback_handles = Arc::clone(&handles);

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => forward_event(event, &callback_handles, &sink),
                Err(e) => warn!("Watch error: {}", e),
            }
        })
        .map_err(notify_error)?;

        Ok(Box::new(FsWatch {
            watcher,
            root: self.root.clone(),
            handles,
            next_handle: 1,
        }))
    }
}

#[derive(Default)]
struct DirHandles {
    by_path: HashMap<PathBuf, WatchHandle>,
    by_handle: HashMap<WatchHandle, PathBuf>,
}

struct FsWatch {
    watcher: notify::RecommendedWatcher,
    root: PathBuf,
    handles: Arc<Mutex<DirHandles>>,
    next_handle: u64,
}

impl WatchPrimitive for FsWatch {
    fn add_watch(&mut self, dir: &str) -> Result<WatchHandle, SourceError> {
        let abs = if dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir)
        };
        self.watcher
            .watch(&abs, RecursiveMode::NonRecursive)
            .map_err(notify_error)?;

        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| SourceError::Unavailable("watch table poisoned".to_string()))?;
        if let Some(old) = handles.by_path.insert(abs.clone(), handle) {
            handles.by_handle.remove(&old);
        }
        handles.by_handle.insert(handle, abs);
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> Result<(), SourceError> {
        let path = {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| SourceError::Unavailable("watch table poisoned".to_string()))?;
            let Some(path) = handles.by_handle.remove(&handle) else {
                return Ok(());
            };
            handles.by_path.remove(&path);
            path
        };
        // The directory may already be gone, in which case the OS
        // dropped the watch for us.
        if let Err(e) = self.watcher.unwatch(&path) {
            trace!("unwatch {} failed: {}", path.display(), e);
        }
        Ok(())
    }
}

fn notify_error(err: notify::Error) -> SourceError {
    match err.kind {
        notify::ErrorKind::Io(io) => SourceError::from_io(
            err.paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            io,
        ),
        notify::ErrorKind::PathNotFound => SourceError::NotFound(
            err.paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        notify::ErrorKind::MaxFilesWatch => {
            SourceError::Unavailable("watch limit reached".to_string())
        }
        other => SourceError::Unavailable(format!("{:?}", other)),
    }
}

fn raw_kind(kind: &EventKind, path: &Path) -> Option<(RawKind, Option<bool>)> {
    match kind {
        EventKind::Create(CreateKind::Folder) => Some((RawKind::Created, Some(true))),
        EventKind::Create(CreateKind::File) => Some((RawKind::Created, Some(false))),
        EventKind::Create(_) => Some((RawKind::Created, Some(path.is_dir()))),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some((RawKind::MovedFrom, None)),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some((RawKind::MovedTo, Some(path.is_dir())))
        }
        // We pair the halves ourselves
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                Some((RawKind::MovedTo, Some(path.is_dir())))
            } else {
                Some((RawKind::MovedFrom, None))
            }
        }
        EventKind::Modify(_) => Some((RawKind::Modified, Some(path.is_dir()))),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            Some((RawKind::Modified, Some(false)))
        }
        EventKind::Remove(RemoveKind::Folder) => Some((RawKind::Deleted, Some(true))),
        EventKind::Remove(RemoveKind::File) => Some((RawKind::Deleted, Some(false))),
        EventKind::Remove(_) => Some((RawKind::Deleted, None)),
        _ => None,
    }
}

fn forward_event(event: Event, handles: &Mutex<DirHandles>, sink: &RawSink) {
    if event.need_rescan() {
        sink.send(RawEvent::Overflow);
        return;
    }

    let cookie = event.tracker();
    for path in &event.paths {
        let Some((kind, is_dir)) = raw_kind(&event.kind, path) else {
            continue;
        };
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            continue;
        };
        let handle = match handles.lock() {
            Ok(handles) => handles.by_path.get(parent).copied(),
            Err(_) => None,
        };
        let (Some(handle), Some(name)) = (handle, name.to_str()) else {
            trace!("No watch registered for {}", path.display());
            continue;
        };
        sink.send(RawEvent::Change(RawChange {
            handle,
            name: name.to_string(),
            kind,
            is_dir,
            cookie,
        }));
    }
}
