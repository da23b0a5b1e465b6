//! Reconciliation of file changes into the index.
//!
//! The indexer is the only writer of File records. It takes batches of
//! [`FileChange`]s from the crawler or the watcher, folds them into the
//! index in one transaction, and publishes a [`Signal`] for every
//! change handlers need to hear about. Handler answers are applied in
//! a second transaction.
//!
//! Re-delivering a change that is already reflected in the index is a
//! no-op: nothing is written and nothing is published.

use crate::events::{DiscoveredFile, FileChange};
use crate::signals::{HandlerAction, Signal, SignalBus, SignalKind};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trove_core::{AssetId, AssetRecord, AssetState, FileRecord, FileState, LibraryId};
use trove_store::{CommitStats, IndexStore, IndexTxn, IndexView, StoreError};

/// What one call to [`Indexer::apply`] did.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub commit: CommitStats,
    /// Every signal published, in order.
    pub signals: Vec<Signal>,
    /// Signals on which at least one handler failed.
    pub handler_failures: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.commit.files_written += other.commit.files_written;
        self.commit.files_removed += other.commit.files_removed;
        self.commit.assets_written += other.commit.assets_written;
        self.commit.assets_removed += other.commit.assets_removed;
        self.signals.extend(other.signals);
        self.handler_failures += other.handler_failures;
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.signals.iter().filter(|s| s.kind == kind).count()
    }
}

/// Single writer for one library's files.
pub struct Indexer {
    library: LibraryId,
    context: String,
    store: IndexStore,
    bus: Arc<SignalBus>,
}

/// Staging state for one batch.
struct Stage<'s> {
    txn: IndexTxn<'s>,
    now: DateTime<Utc>,
    pending: Vec<Signal>,
    orphaned: HashSet<AssetId>,
}

impl Indexer {
    pub fn new(
        library: LibraryId,
        context: impl Into<String>,
        store: IndexStore,
        bus: Arc<SignalBus>,
    ) -> Self {
        Self {
            library,
            context: context.into(),
            store,
            bus,
        }
    }

    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Reconciles `changes` and publishes the resulting signals.
    pub fn apply(&self, changes: Vec<FileChange>) -> Result<ApplyReport, StoreError> {
        if changes.is_empty() {
            return Ok(ApplyReport::default());
        }

        let mut stage = Stage {
            txn: self.store.begin(&self.library),
            now: Utc::now(),
            pending: Vec::new(),
            orphaned: HashSet::new(),
        };
        for change in changes {
            debug!("Reconciling {:?}", change);
            self.stage_change(&mut stage, change)?;
        }
        let Stage { txn, pending, .. } = stage;
        let commit = txn.commit()?;

        let mut report = self.publish(pending)?;
        report.commit.files_written += commit.files_written;
        report.commit.files_removed += commit.files_removed;
        report.commit.assets_written += commit.assets_written;
        report.commit.assets_removed += commit.assets_removed;
        Ok(report)
    }

    /// Deletes files that have been missing for longer than `window`.
    ///
    /// An asset left without any file is removed as well, and an
    /// `asset-removed` signal is published for it.
    pub fn purge_missing(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<ApplyReport, StoreError> {
        let mut expired: Vec<FileRecord> = self
            .store
            .files(&self.library)?
            .into_values()
            .filter(|record| record.state == FileState::Missing)
            .filter(|record| {
                record
                    .missing_since
                    .and_then(|since| (now - since).to_std().ok())
                    .is_some_and(|age| age >= window)
            })
            .collect();
        if expired.is_empty() {
            return Ok(ApplyReport::default());
        }
        expired.sort_by(|a, b| a.path.cmp(&b.path));

        let mut txn = self.store.begin(&self.library);
        let mut pending = Vec::new();
        for record in &expired {
            debug!("Purging '{}'", record.path);
            txn.remove_file(&record.path)?;
        }
        for record in &expired {
            let Some(asset) = record.asset else { continue };
            if txn.asset(asset)?.is_none() || !txn.asset_files(asset)?.is_empty() {
                continue;
            }
            txn.remove_asset(asset);
            let mut signal = self.signal(SignalKind::AssetRemoved, record);
            signal.available = false;
            pending.push(signal);
        }
        let commit = txn.commit()?;
        info!("Purged {} missing files from {}", expired.len(), self.library);

        let mut report = self.publish(pending)?;
        report.commit.files_removed += commit.files_removed;
        report.commit.assets_removed += commit.assets_removed;
        Ok(report)
    }

    fn signal(&self, kind: SignalKind, record: &FileRecord) -> Signal {
        Signal {
            kind,
            library: self.library.clone(),
            context: self.context.clone(),
            path: record.path.clone(),
            hash: record.hash,
            available: record.is_available(),
            previous_hash: None,
            previous_path: None,
            asset: record.asset,
        }
    }

    fn stage_change(&self, stage: &mut Stage<'_>, change: FileChange) -> Result<(), StoreError> {
        match change {
            FileChange::Discovered(file) => self.stage_discovered(stage, file),
            FileChange::Reevaluate { path } => {
                if let Some(record) = stage.txn.file(&self.library, &path)? {
                    if record.is_available() {
                        stage.pending.push(self.signal(SignalKind::FileAvailable, &record));
                    }
                }
                Ok(())
            }
            FileChange::Removed { path } => self.stage_removed(stage, &path),
            FileChange::Moved { from, to } => self.stage_moved(stage, &from, &to),
            FileChange::DirectoryRemoved { path } => {
                for record in stage.txn.files_under(&path)? {
                    self.stage_removed(stage, &record.path)?;
                }
                Ok(())
            }
            FileChange::DirectoryMoved { from, to } => {
                let prefix_len = from.trim_end_matches('/').len();
                for record in stage.txn.files_under(&from)? {
                    let target = format!("{}{}", to.trim_end_matches('/'), &record.path[prefix_len..]);
                    self.stage_moved(stage, &record.path, &target)?;
                }
                Ok(())
            }
        }
    }

    fn stage_discovered(&self, stage: &mut Stage<'_>, file: DiscoveredFile) -> Result<(), StoreError> {
        let existing = stage.txn.file(&self.library, &file.path)?;

        match existing {
            Some(mut record) if record.hash == file.hash => {
                let restored = !record.is_available();
                let touched = !record.metadata_matches(file.size, file.mtime_ns);
                if !restored && !touched {
                    return Ok(());
                }
                record.size = file.size;
                record.mtime_ns = file.mtime_ns;
                record.state = FileState::Indexed;
                record.missing_since = None;
                record.updated_at = stage.now;
                stage.txn.put_file(record.clone())?;
                if restored || record.needs_reevaluation {
                    stage.pending.push(self.signal(SignalKind::FileAvailable, &record));
                }
            }
            Some(mut record) => {
                record.previous_hash = Some(record.hash);
                record.hash = file.hash;
                record.size = file.size;
                record.mtime_ns = file.mtime_ns;
                record.state = FileState::Indexed;
                record.missing_since = None;
                record.updated_at = stage.now;
                if let Some(asset_id) = record.asset {
                    if let Some(mut asset) = stage.txn.asset(asset_id)? {
                        asset.needs_reevaluation = true;
                        stage.txn.put_asset(asset);
                    }
                }
                stage.txn.put_file(record.clone())?;
                let mut signal = self.signal(SignalKind::FileAvailable, &record);
                signal.previous_hash = record.previous_hash;
                stage.pending.push(signal);
            }
            None => {
                // A missing file with the same content reappearing
                // elsewhere is that file having moved
                let missing = stage
                    .txn
                    .files_with_hash(&self.library, &file.hash)?
                    .into_iter()
                    .find(|record| record.state == FileState::Missing);

                match missing {
                    Some(mut record) => {
                        let from = record.path.clone();
                        stage.txn.remove_file(&from)?;
                        record.path = file.path;
                        record.size = file.size;
                        record.mtime_ns = file.mtime_ns;
                        record.state = FileState::Indexed;
                        record.missing_since = None;
                        record.updated_at = stage.now;
                        stage.txn.put_file(record.clone())?;
                        debug!("'{}' reappeared as '{}'", from, record.path);
                        let mut signal = self.signal(SignalKind::FileMoved, &record);
                        signal.previous_path = Some(from);
                        stage.pending.push(signal);
                    }
                    None => {
                        let mut record = FileRecord::hashed(
                            self.library.clone(),
                            file.path,
                            file.hash,
                            file.size,
                            file.mtime_ns,
                        );
                        record.state = FileState::Indexed;
                        record.updated_at = stage.now;
                        stage.txn.put_file(record.clone())?;
                        stage.pending.push(self.signal(SignalKind::FileAvailable, &record));
                    }
                }
            }
        }
        Ok(())
    }

    fn stage_removed(&self, stage: &mut Stage<'_>, path: &str) -> Result<(), StoreError> {
        let Some(mut record) = stage.txn.file(&self.library, path)? else {
            return Ok(());
        };
        if !record.is_available() {
            return Ok(());
        }
        record.state = FileState::Missing;
        record.missing_since = Some(stage.now);
        record.updated_at = stage.now;
        stage.txn.put_file(record.clone())?;
        stage.pending.push(self.signal(SignalKind::FileUnavailable, &record));
        self.check_orphaned(stage, &record)
    }

    fn stage_moved(&self, stage: &mut Stage<'_>, from: &str, to: &str) -> Result<(), StoreError> {
        if from == to {
            return Ok(());
        }
        let Some(mut record) = stage.txn.file(&self.library, from)? else {
            debug!("Move of untracked '{}' ignored", from);
            return Ok(());
        };

        // Renaming over an existing file replaces it
        let replaced = stage.txn.file(&self.library, to)?;
        if let Some(old) = &replaced {
            stage.txn.remove_file(to)?;
            if old.is_available() {
                let mut signal = self.signal(SignalKind::FileUnavailable, old);
                signal.available = false;
                stage.pending.push(signal);
            }
        }

        stage.txn.remove_file(from)?;
        record.path = to.to_string();
        record.updated_at = stage.now;
        stage.txn.put_file(record.clone())?;
        if record.is_available() {
            let mut signal = self.signal(SignalKind::FileMoved, &record);
            signal.previous_path = Some(from.to_string());
            stage.pending.push(signal);
        }

        match replaced {
            Some(old) if old.is_available() => self.check_orphaned(stage, &old),
            _ => Ok(()),
        }
    }

    /// Queues `asset-orphaned` if `record` was its asset's last
    /// available file. Once per asset and batch.
    fn check_orphaned(&self, stage: &mut Stage<'_>, record: &FileRecord) -> Result<(), StoreError> {
        let Some(asset) = record.asset else {
            return Ok(());
        };
        if stage.orphaned.contains(&asset) || stage.txn.asset_has_available_file(asset)? {
            return Ok(());
        }
        stage.orphaned.insert(asset);
        let mut signal = self.signal(SignalKind::AssetOrphaned, record);
        signal.available = false;
        stage.pending.push(signal);
        Ok(())
    }

    /// Delivers `pending` and applies what handlers answered.
    fn publish(&self, pending: Vec<Signal>) -> Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut txn = self.store.begin(&self.library);
        let mut queue: VecDeque<Signal> = pending.into();

        while let Some(signal) = queue.pop_front() {
            let dispatch = self.bus.dispatch(&signal, &txn);
            if dispatch.failed() {
                report.handler_failures += 1;
                self.mark_for_reevaluation(&mut txn, &signal)?;
            } else {
                let actions: Vec<HandlerAction> =
                    dispatch.actions.into_iter().map(|(_, action)| action).collect();
                self.apply_actions(&mut txn, &signal, &actions, &mut queue)?;
                self.settle(&mut txn, &signal, &actions)?;
            }
            report.signals.push(signal);
        }

        report.commit = txn.commit()?;
        Ok(report)
    }

    fn mark_for_reevaluation(&self, txn: &mut IndexTxn<'_>, signal: &Signal) -> Result<(), StoreError> {
        if let Some(mut record) = txn.file(&self.library, &signal.path)? {
            if !record.needs_reevaluation {
                record.needs_reevaluation = true;
                txn.put_file(record)?;
            }
        }
        if let Some(asset_id) = signal.asset {
            if let Some(mut asset) = txn.asset(asset_id)? {
                if !asset.needs_reevaluation {
                    asset.needs_reevaluation = true;
                    txn.put_asset(asset);
                }
            }
        }
        Ok(())
    }

    fn apply_actions(
        &self,
        txn: &mut IndexTxn<'_>,
        signal: &Signal,
        actions: &[HandlerAction],
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), StoreError> {
        let claims: Vec<HandlerAction> = actions
            .iter()
            .copied()
            .filter(|a| matches!(a, HandlerAction::Claim(_) | HandlerAction::Attach(_)))
            .collect();
        if claims.len() > 1 {
            warn!(
                "Conflicting claims for '{}' in {}: {:?}; leaving it unclaimed",
                signal.path, self.library, claims
            );
        } else if let Some(claim) = claims.first() {
            self.claim(txn, signal, *claim, queue)?;
        }

        for action in actions {
            match action {
                HandlerAction::Release => {
                    let Some(mut record) = txn.file(&self.library, &signal.path)? else {
                        continue;
                    };
                    let Some(asset) = record.asset.take() else {
                        continue;
                    };
                    txn.put_file(record.clone())?;
                    self.queue_if_orphaned(txn, asset, &record, queue)?;
                }
                HandlerAction::RemoveAsset => {
                    let Some(asset_id) = signal.asset else { continue };
                    if txn.asset(asset_id)?.is_none() {
                        continue;
                    }
                    for mut record in txn.asset_files(asset_id)? {
                        record.asset = None;
                        txn.put_file(record)?;
                    }
                    txn.remove_asset(asset_id);
                    debug!("Removed asset {}", asset_id);
                    let mut removed = signal.clone();
                    removed.kind = SignalKind::AssetRemoved;
                    removed.asset = Some(asset_id);
                    queue.push_back(removed);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn claim(
        &self,
        txn: &mut IndexTxn<'_>,
        signal: &Signal,
        claim: HandlerAction,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), StoreError> {
        let Some(mut record) = txn.file(&self.library, &signal.path)? else {
            return Ok(());
        };
        if !record.is_available() {
            debug!("Ignoring claim on unavailable '{}'", record.path);
            return Ok(());
        }

        match claim {
            HandlerAction::Claim(variant) => {
                if record.asset.is_some() {
                    debug!("'{}' is already claimed", record.path);
                    return Ok(());
                }
                let asset = AssetRecord::claimed(self.library.clone(), variant);
                debug!("Claimed '{}' as {} {}", record.path, variant, asset.id);
                record.asset = Some(asset.id);
                txn.put_asset(asset);
                txn.put_file(record)?;
            }
            HandlerAction::Attach(target) => {
                if record.asset == Some(target) {
                    return Ok(());
                }
                match txn.asset(target)? {
                    Some(mut asset) if asset.state != AssetState::Removed => {
                        let previous = record.asset.replace(target);
                        if asset.state == AssetState::Orphaned {
                            asset.state = AssetState::Claimed;
                            txn.put_asset(asset);
                        }
                        txn.put_file(record.clone())?;
                        if let Some(previous) = previous {
                            self.queue_if_orphaned(txn, previous, &record, queue)?;
                        }
                    }
                    _ => warn!("Cannot attach '{}' to unknown asset {}", record.path, target),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn queue_if_orphaned(
        &self,
        txn: &IndexTxn<'_>,
        asset: AssetId,
        record: &FileRecord,
        queue: &mut VecDeque<Signal>,
    ) -> Result<(), StoreError> {
        if txn.asset(asset)?.is_none() || txn.asset_has_available_file(asset)? {
            return Ok(());
        }
        let mut signal = self.signal(SignalKind::AssetOrphaned, record);
        signal.asset = Some(asset);
        signal.available = false;
        queue.push_back(signal);
        Ok(())
    }

    /// Bookkeeping after every handler accepted a signal.
    fn settle(
        &self,
        txn: &mut IndexTxn<'_>,
        signal: &Signal,
        actions: &[HandlerAction],
    ) -> Result<(), StoreError> {
        let record = txn.file(&self.library, &signal.path)?;
        let file_signal = matches!(signal.kind, SignalKind::FileAvailable | SignalKind::FileMoved);
        if let Some(current) = &record {
            if current.needs_reevaluation && current.is_available() && file_signal {
                let mut cleared = current.clone();
                cleared.needs_reevaluation = false;
                txn.put_file(cleared)?;
            }
        }

        match signal.kind {
            SignalKind::AssetOrphaned if !actions.contains(&HandlerAction::RemoveAsset) => {
                if let Some(mut asset) = signal.asset.map(|id| txn.asset(id)).transpose()?.flatten() {
                    if asset.state == AssetState::Claimed && !txn.asset_has_available_file(asset.id)? {
                        asset.state = AssetState::Orphaned;
                        txn.put_asset(asset);
                    }
                }
            }
            SignalKind::FileAvailable | SignalKind::FileMoved => {
                let Some(asset_id) = record.and_then(|r| r.asset) else {
                    return Ok(());
                };
                if let Some(mut asset) = txn.asset(asset_id)? {
                    let changed = asset.state == AssetState::Orphaned
                        || (asset.needs_reevaluation && signal.kind == SignalKind::FileAvailable);
                    if changed {
                        asset.state = AssetState::Claimed;
                        asset.needs_reevaluation = false;
                        txn.put_asset(asset);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{HandlerError, SignalHandler};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use trove_core::{AssetVariant, ContentHash};

    /// Claims every available unclaimed file, deletes orphaned assets.
    struct Claimer {
        seen: Mutex<Vec<(SignalKind, String)>>,
        fail_on: Option<String>,
    }

    impl SignalHandler for Claimer {
        fn name(&self) -> &str {
            "claimer"
        }

        fn handle(&self, signal: &Signal, index: &dyn IndexView) -> Result<HandlerAction, HandlerError> {
            self.seen.lock().unwrap().push((signal.kind, signal.path.clone()));
            if self.fail_on.as_deref() == Some(signal.path.as_str()) {
                return Err(HandlerError::Failed("no".into()));
            }
            Ok(match signal.kind {
                SignalKind::FileAvailable => {
                    let record = index.file(&signal.library, &signal.path)?;
                    match record {
                        Some(r) if r.asset.is_none() => HandlerAction::Claim(AssetVariant::Generic),
                        _ => HandlerAction::None,
                    }
                }
                SignalKind::AssetOrphaned => HandlerAction::RemoveAsset,
                _ => HandlerAction::None,
            })
        }
    }

    fn setup(fail_on: Option<&str>) -> (TempDir, Indexer, Arc<Claimer>) {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let claimer = Arc::new(Claimer {
            seen: Mutex::new(Vec::new()),
            fail_on: fail_on.map(str::to_string),
        });
        let mut bus = SignalBus::new();
        bus.register_all("gallery", claimer.clone());
        let indexer = Indexer::new(LibraryId::new("lib"), "gallery", store, Arc::new(bus));
        (dir, indexer, claimer)
    }

    fn found(path: &str, content: &[u8]) -> FileChange {
        FileChange::Discovered(DiscoveredFile {
            path: path.to_string(),
            size: content.len() as u64,
            mtime_ns: 1,
            hash: ContentHash::of_bytes(content),
        })
    }

    fn file(indexer: &Indexer, path: &str) -> Option<FileRecord> {
        indexer.store().file(indexer.library(), path).unwrap()
    }

    #[test]
    fn test_new_file_is_indexed_and_claimed() {
        let (_dir, indexer, _) = setup(None);
        let report = indexer.apply(vec![found("a.txt", b"hi")]).unwrap();

        assert_eq!(report.count(SignalKind::FileAvailable), 1);
        let record = file(&indexer, "a.txt").unwrap();
        assert_eq!(record.state, FileState::Indexed);
        assert_eq!(record.hash, ContentHash::of_bytes(b"hi"));
        let asset = indexer.store().asset(record.asset.unwrap()).unwrap().unwrap();
        assert_eq!(asset.state, AssetState::Claimed);
    }

    #[test]
    fn test_redelivery_is_a_noop() {
        let (_dir, indexer, _) = setup(None);
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        let report = indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        assert!(report.signals.is_empty());
        assert_eq!(report.commit.mutations(), 0);
    }

    #[test]
    fn test_content_change_keeps_previous_hash() {
        let (_dir, indexer, _) = setup(None);
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        let report = indexer.apply(vec![found("a.txt", b"bye")]).unwrap();

        assert_eq!(report.count(SignalKind::FileAvailable), 1);
        assert_eq!(report.signals[0].previous_hash, Some(ContentHash::of_bytes(b"hi")));
        let record = file(&indexer, "a.txt").unwrap();
        assert_eq!(record.hash, ContentHash::of_bytes(b"bye"));
        let asset = indexer.store().asset(record.asset.unwrap()).unwrap().unwrap();
        assert!(!asset.needs_reevaluation);
    }

    #[test]
    fn test_removal_orphans_and_handler_removes_asset() {
        let (_dir, indexer, _) = setup(None);
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        let asset = file(&indexer, "a.txt").unwrap().asset.unwrap();

        let report = indexer
            .apply(vec![FileChange::Removed { path: "a.txt".into() }])
            .unwrap();
        assert_eq!(report.count(SignalKind::FileUnavailable), 1);
        assert_eq!(report.count(SignalKind::AssetOrphaned), 1);
        assert_eq!(report.count(SignalKind::AssetRemoved), 1);

        let record = file(&indexer, "a.txt").unwrap();
        assert_eq!(record.state, FileState::Missing);
        assert!(record.missing_since.is_some());
        assert!(record.asset.is_none());
        assert!(indexer.store().asset(asset).unwrap().is_none());

        let again = indexer
            .apply(vec![FileChange::Removed { path: "a.txt".into() }])
            .unwrap();
        assert!(again.signals.is_empty());
    }

    #[test]
    fn test_identical_content_is_not_merged() {
        let (_dir, indexer, _) = setup(None);
        indexer
            .apply(vec![found("a.txt", b"same"), found("b.txt", b"same")])
            .unwrap();
        let a = file(&indexer, "a.txt").unwrap();
        let b = file(&indexer, "b.txt").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.asset, b.asset);
    }

    #[test]
    fn test_move_keeps_asset() {
        let (_dir, indexer, _) = setup(None);
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        let asset = file(&indexer, "a.txt").unwrap().asset;

        let report = indexer
            .apply(vec![FileChange::Moved {
                from: "a.txt".into(),
                to: "b.txt".into(),
            }])
            .unwrap();
        assert_eq!(report.signals.len(), 1);
        assert_eq!(report.signals[0].kind, SignalKind::FileMoved);
        assert_eq!(report.signals[0].previous_path.as_deref(), Some("a.txt"));
        assert!(file(&indexer, "a.txt").is_none());
        assert_eq!(file(&indexer, "b.txt").unwrap().asset, asset);
    }

    #[test]
    fn test_directory_move_rekeys_everything() {
        let (_dir, indexer, _) = setup(None);
        indexer
            .apply(vec![found("old/a.txt", b"a"), found("old/sub/b.txt", b"b"), found("older.txt", b"c")])
            .unwrap();

        indexer
            .apply(vec![FileChange::DirectoryMoved {
                from: "old".into(),
                to: "new".into(),
            }])
            .unwrap();
        assert!(file(&indexer, "new/a.txt").is_some());
        assert!(file(&indexer, "new/sub/b.txt").is_some());
        assert!(file(&indexer, "old/a.txt").is_none());
        assert!(file(&indexer, "older.txt").is_some());
    }

    #[test]
    fn test_missing_file_reappearing_is_a_move() {
        let (_dir, indexer, _) = setup(None);
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        // Keep the asset alive across the gap: no handler removal here
        let mut bus = SignalBus::new();
        bus.register_all("gallery", Arc::new(Claimer {
            seen: Mutex::new(Vec::new()),
            fail_on: Some("a.txt".into()),
        }));
        let quiet = Indexer::new(indexer.library().clone(), "gallery", indexer.store().clone(), Arc::new(bus));
        quiet.apply(vec![FileChange::Removed { path: "a.txt".into() }]).unwrap();

        let report = indexer.apply(vec![found("moved/a.txt", b"hi")]).unwrap();
        assert_eq!(report.count(SignalKind::FileMoved), 1);
        assert!(file(&indexer, "a.txt").is_none());
        let record = file(&indexer, "moved/a.txt").unwrap();
        assert!(record.is_available());
        assert!(record.asset.is_some());
    }

    #[test]
    fn test_handler_failure_marks_file_for_reevaluation() {
        let (_dir, indexer, claimer) = setup(Some("bad.txt"));
        let report = indexer
            .apply(vec![found("bad.txt", b"x"), found("good.txt", b"y")])
            .unwrap();
        assert_eq!(report.handler_failures, 1);

        let bad = file(&indexer, "bad.txt").unwrap();
        assert!(bad.needs_reevaluation);
        assert!(bad.asset.is_none());
        let good = file(&indexer, "good.txt").unwrap();
        assert!(good.asset.is_some());
        assert_eq!(claimer.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_purge_removes_expired_files_and_assets() {
        // The failing handler keeps a.txt unclaimed, the asset is attached by hand
        let (_dir, indexer, _) = setup(Some("a.txt"));
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        let mut record = file(&indexer, "a.txt").unwrap();
        let asset = AssetRecord::claimed(indexer.library().clone(), AssetVariant::Photo);
        record.asset = Some(asset.id);
        record.state = FileState::Missing;
        record.missing_since = Some(Utc::now() - chrono::Duration::seconds(600));
        let mut txn = indexer.store().begin(indexer.library());
        txn.put_asset(asset.clone());
        txn.put_file(record).unwrap();
        txn.commit().unwrap();

        let kept = indexer
            .purge_missing(Utc::now(), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(kept.commit.files_removed, 0);
        assert!(file(&indexer, "a.txt").is_some());

        let report = indexer
            .purge_missing(Utc::now(), Duration::from_secs(300))
            .unwrap();
        assert_eq!(report.count(SignalKind::AssetRemoved), 1);
        assert!(file(&indexer, "a.txt").is_none());
        assert!(indexer.store().asset(asset.id).unwrap().is_none());
    }

    #[test]
    fn test_conflicting_claims_leave_file_unclaimed() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let mut bus = SignalBus::new();
        for _ in 0..2 {
            bus.register_all("gallery", Arc::new(Claimer {
                seen: Mutex::new(Vec::new()),
                fail_on: None,
            }));
        }
        let indexer = Indexer::new(LibraryId::new("lib"), "gallery", store, Arc::new(bus));
        indexer.apply(vec![found("a.txt", b"hi")]).unwrap();
        assert!(file(&indexer, "a.txt").unwrap().asset.is_none());
    }
}
