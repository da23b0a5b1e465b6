//! Live change tracking.
//!
//! Backends only offer flat, per-directory watches and report events
//! as (handle, name) pairs. This module keeps the handle/path table,
//! registers and drops whole subtrees, and turns a batch of raw
//! notifications into [`WatchChange`]s.
//!
//! Rename halves are paired within one notification batch only. A
//! half whose partner is not in the same batch degrades to a plain
//! delete or create.

use crate::backend::{
    is_within, join_path, RawChange, RawEvent, RawKind, SourceBackend, WatchHandle,
    WatchPrimitive,
};
use crate::events::WatchChange;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace, warn};
use trove_core::SourceError;

/// Bidirectional watch handle <-> directory path mapping.
#[derive(Debug, Default, Clone)]
pub struct WatchTable {
    by_handle: HashMap<WatchHandle, String>,
    by_path: BTreeMap<String, WatchHandle>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: WatchHandle, dir: impl Into<String>) {
        let dir = dir.into();
        if let Some(old) = self.by_path.insert(dir.clone(), handle) {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, dir);
    }

    pub fn remove(&mut self, handle: WatchHandle) -> Option<String> {
        let dir = self.by_handle.remove(&handle)?;
        self.by_path.remove(&dir);
        Some(dir)
    }

    pub fn path_of(&self, handle: WatchHandle) -> Option<&str> {
        self.by_handle.get(&handle).map(String::as_str)
    }

    pub fn handle_of(&self, dir: &str) -> Option<WatchHandle> {
        self.by_path.get(dir).copied()
    }

    pub fn is_watched(&self, dir: &str) -> bool {
        self.by_path.contains_key(dir)
    }

    /// The path an event names, given the handle it arrived on.
    pub fn resolve(&self, handle: WatchHandle, name: &str) -> Option<String> {
        self.path_of(handle).map(|dir| join_path(dir, name))
    }

    /// `dir` and every watched directory below it.
    pub fn subtree(&self, dir: &str) -> Vec<(String, WatchHandle)> {
        self.by_path
            .range(dir.to_string()..)
            .take_while(|(path, _)| dir.is_empty() || path.starts_with(dir))
            .filter(|(path, _)| is_within(path, dir))
            .map(|(path, handle)| (path.clone(), *handle))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

/// Recursive watch management on top of a [`WatchPrimitive`].
pub struct Watcher {
    table: WatchTable,
    primitive: Option<Box<dyn WatchPrimitive>>,
    next_detached: u64,
}

impl Default for Watcher {
    fn default() -> Self {
        Self::detached()
    }
}

impl Watcher {
    /// A watcher with no live backend. Registrations only touch the
    /// table, which is what scan-only libraries and tests want.
    pub fn detached() -> Self {
        Self {
            table: WatchTable::new(),
            primitive: None,
            next_detached: 1,
        }
    }

    pub fn new(primitive: Box<dyn WatchPrimitive>) -> Self {
        Self {
            table: WatchTable::new(),
            primitive: Some(primitive),
            next_detached: 1,
        }
    }

    pub fn is_live(&self) -> bool {
        self.primitive.is_some()
    }

    pub fn table(&self) -> &WatchTable {
        &self.table
    }

    fn add(&mut self, dir: &str) -> Result<WatchHandle, SourceError> {
        if let Some(existing) = self.table.handle_of(dir) {
            return Ok(existing);
        }
        let handle = match self.primitive.as_mut() {
            Some(primitive) => primitive.add_watch(dir)?,
            None => {
                self.next_detached += 1;
                WatchHandle(self.next_detached - 1)
            }
        };
        self.table.insert(handle, dir);
        Ok(handle)
    }

    /// Watches `dir` and every directory below it.
    ///
    /// Returns how many directories were registered. On error the
    /// subtree is only partially covered and the caller must treat
    /// the library's watch state as degraded.
    pub fn register_subtree(
        &mut self,
        backend: &dyn SourceBackend,
        dir: &str,
    ) -> Result<usize, SourceError> {
        self.add(dir)?;
        let mut count = 1;
        for entry in backend.enumerate(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(SourceError::PermissionDenied(path)) => {
                    warn!("Cannot watch {}: permission denied", path);
                    continue;
                }
                Err(SourceError::NotFound(path)) => {
                    trace!("{} vanished while registering watches", path);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if entry.is_dir() {
                self.add(&entry.path)?;
                count += 1;
            }
        }
        debug!("Watching {} directories under '{}'", count, dir);
        Ok(count)
    }

    /// Drops the watches for `dir` and everything below it.
    pub fn deregister_subtree(&mut self, dir: &str) -> usize {
        let subtree = self.table.subtree(dir);
        for (path, handle) in &subtree {
            self.table.remove(*handle);
            if let Some(primitive) = self.primitive.as_mut() {
                if let Err(e) = primitive.remove_watch(*handle) {
                    debug!("Failed to drop watch for '{}': {}", path, e);
                }
            }
        }
        subtree.len()
    }

    /// Normalizes one batch of raw notifications.
    pub fn normalize(&self, batch: Vec<RawEvent>) -> Vec<WatchChange> {
        normalize_batch(&self.table, batch)
    }
}

struct Resolved {
    path: String,
    kind: RawKind,
    is_dir: Option<bool>,
    cookie: Option<usize>,
}

fn resolve(table: &WatchTable, change: RawChange) -> Option<Resolved> {
    let Some(path) = table.resolve(change.handle, &change.name) else {
        trace!("Event for unknown watch {}", change.handle);
        return None;
    };
    Some(Resolved {
        path,
        kind: change.kind,
        is_dir: change.is_dir,
        cookie: change.cookie,
    })
}

/// Finds the `MovedTo` half matching the `MovedFrom` at `from_idx`.
fn find_partner(events: &[Resolved], consumed: &[bool], from_idx: usize) -> Option<usize> {
    let from = &events[from_idx];
    match from.cookie {
        Some(cookie) => events
            .iter()
            .enumerate()
            .skip(from_idx + 1)
            .find(|(i, e)| !consumed[*i] && e.kind == RawKind::MovedTo && e.cookie == Some(cookie))
            .map(|(i, _)| i),
        // Without cookies only an immediately following half counts
        None => events
            .get(from_idx + 1)
            .filter(|e| e.kind == RawKind::MovedTo && e.cookie.is_none())
            .map(|_| from_idx + 1),
    }
}

/// Turns raw notifications into [`WatchChange`]s.
///
/// - moved-from/moved-to pairs in the batch become one move
/// - unpaired halves degrade to delete or create
/// - a modify right after a create of the same path is dropped, and
///   repeated modifies collapse into one
/// - an overflow anywhere in the batch is reported once, at the end
pub fn normalize_batch(table: &WatchTable, batch: Vec<RawEvent>) -> Vec<WatchChange> {
    let mut overflow = false;
    let mut events = Vec::with_capacity(batch.len());
    for raw in batch {
        match raw {
            RawEvent::Overflow => overflow = true,
            RawEvent::Change(change) => events.extend(resolve(table, change)),
        }
    }

    let is_dir = |e: &Resolved| e.is_dir.unwrap_or_else(|| table.is_watched(&e.path));

    let mut consumed = vec![false; events.len()];
    let mut fresh: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for i in 0..events.len() {
        if consumed[i] {
            continue;
        }
        consumed[i] = true;
        let event = &events[i];

        match event.kind {
            RawKind::MovedFrom => {
                let dir = is_dir(event);
                fresh.remove(&event.path);
                if let Some(j) = find_partner(&events, &consumed, i) {
                    consumed[j] = true;
                    let to = events[j].path.clone();
                    fresh.remove(&to);
                    if dir || events[j].is_dir == Some(true) {
                        out.push(WatchChange::DirMoved {
                            from: event.path.clone(),
                            to,
                        });
                    } else {
                        out.push(WatchChange::Moved {
                            from: event.path.clone(),
                            to,
                        });
                    }
                } else if dir {
                    out.push(WatchChange::DirRemoved(event.path.clone()));
                } else {
                    out.push(WatchChange::Deleted(event.path.clone()));
                }
            }
            RawKind::MovedTo | RawKind::Created => {
                if is_dir(event) {
                    out.push(WatchChange::DirCreated(event.path.clone()));
                } else {
                    fresh.insert(event.path.clone());
                    out.push(WatchChange::Created(event.path.clone()));
                }
            }
            RawKind::Modified => {
                if event.is_dir == Some(true) || table.is_watched(&event.path) {
                    continue;
                }
                if fresh.insert(event.path.clone()) {
                    out.push(WatchChange::Modified(event.path.clone()));
                }
            }
            RawKind::Deleted => {
                fresh.remove(&event.path);
                if is_dir(event) {
                    out.push(WatchChange::DirRemoved(event.path.clone()));
                } else {
                    out.push(WatchChange::Deleted(event.path.clone()));
                }
            }
        }
    }

    if overflow {
        out.push(WatchChange::Overflow);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> WatchTable {
        let mut table = WatchTable::new();
        table.insert(WatchHandle(1), "");
        table.insert(WatchHandle(2), "photos");
        table.insert(WatchHandle(3), "photos/2024");
        table.insert(WatchHandle(4), "photosets");
        table
    }

    fn raw(handle: u64, name: &str, kind: RawKind, cookie: Option<usize>) -> RawEvent {
        RawEvent::Change(RawChange {
            handle: WatchHandle(handle),
            name: name.to_string(),
            kind,
            is_dir: Some(false),
            cookie,
        })
    }

    #[test]
    fn test_table_subtree_respects_boundaries() {
        let table = table();
        let subtree: Vec<_> = table.subtree("photos").into_iter().map(|(p, _)| p).collect();
        assert_eq!(subtree, vec!["photos", "photos/2024"]);
        assert_eq!(table.subtree("").len(), 4);
        assert_eq!(table.resolve(WatchHandle(3), "a.jpg").as_deref(), Some("photos/2024/a.jpg"));
        assert_eq!(table.resolve(WatchHandle(1), "a.txt").as_deref(), Some("a.txt"));
    }

    #[test]
    fn test_rename_pair_coalesces() {
        let batch = vec![
            raw(1, "a.txt", RawKind::MovedFrom, Some(7)),
            raw(1, "b.txt", RawKind::MovedTo, Some(7)),
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![WatchChange::Moved {
                from: "a.txt".into(),
                to: "b.txt".into()
            }]
        );
    }

    #[test]
    fn test_rename_pair_across_directories() {
        let batch = vec![
            raw(2, "a.jpg", RawKind::MovedFrom, Some(3)),
            raw(1, "unrelated.txt", RawKind::Modified, None),
            raw(3, "a.jpg", RawKind::MovedTo, Some(3)),
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![
                WatchChange::Moved {
                    from: "photos/a.jpg".into(),
                    to: "photos/2024/a.jpg".into()
                },
                WatchChange::Modified("unrelated.txt".into()),
            ]
        );
    }

    #[test]
    fn test_unpaired_halves_degrade() {
        let batch = vec![
            raw(1, "gone.txt", RawKind::MovedFrom, Some(1)),
            raw(1, "arrived.txt", RawKind::MovedTo, Some(2)),
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![
                WatchChange::Deleted("gone.txt".into()),
                WatchChange::Created("arrived.txt".into()),
            ]
        );
    }

    #[test]
    fn test_create_then_modify_collapses() {
        let batch = vec![
            raw(1, "new.txt", RawKind::Created, None),
            raw(1, "new.txt", RawKind::Modified, None),
            raw(1, "other.txt", RawKind::Modified, None),
            raw(1, "other.txt", RawKind::Modified, None),
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![
                WatchChange::Created("new.txt".into()),
                WatchChange::Modified("other.txt".into()),
            ]
        );
    }

    #[test]
    fn test_directory_events_use_table() {
        let batch = vec![
            RawEvent::Change(RawChange {
                handle: WatchHandle(2),
                name: "2024".into(),
                kind: RawKind::Deleted,
                is_dir: None,
                cookie: None,
            }),
            RawEvent::Change(RawChange {
                handle: WatchHandle(1),
                name: "albums".into(),
                kind: RawKind::Created,
                is_dir: Some(true),
                cookie: None,
            }),
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![
                WatchChange::DirRemoved("photos/2024".into()),
                WatchChange::DirCreated("albums".into()),
            ]
        );
    }

    #[test]
    fn test_directory_rename() {
        let batch = vec![
            RawEvent::Change(RawChange {
                handle: WatchHandle(1),
                name: "photos".into(),
                kind: RawKind::MovedFrom,
                is_dir: None,
                cookie: Some(9),
            }),
            RawEvent::Change(RawChange {
                handle: WatchHandle(1),
                name: "pictures".into(),
                kind: RawKind::MovedTo,
                is_dir: Some(true),
                cookie: Some(9),
            }),
        ];
        assert_eq!(
            normalize_batch(&table(), batch),
            vec![WatchChange::DirMoved {
                from: "photos".into(),
                to: "pictures".into()
            }]
        );
    }

    #[test]
    fn test_overflow_reported_once() {
        let batch = vec![
            RawEvent::Overflow,
            raw(1, "a.txt", RawKind::Created, None),
            RawEvent::Overflow,
        ];
        let changes = normalize_batch(&table(), batch);
        assert_eq!(
            changes,
            vec![WatchChange::Created("a.txt".into()), WatchChange::Overflow]
        );
    }

    #[test]
    fn test_unknown_handle_dropped() {
        let changes = normalize_batch(&table(), vec![raw(99, "x", RawKind::Created, None)]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_detached_watcher_deregisters_subtree() {
        let mut watcher = Watcher::detached();
        watcher.add("").unwrap();
        watcher.add("a").unwrap();
        watcher.add("a/b").unwrap();
        watcher.add("ab").unwrap();

        assert_eq!(watcher.deregister_subtree("a"), 2);
        assert!(watcher.table().is_watched("ab"));
        assert!(!watcher.table().is_watched("a/b"));
    }
}
