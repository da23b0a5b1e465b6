//! Staged, all-or-nothing index mutations.
//!
//! The indexer stages every change for one batch of events here and
//! reads its own writes back through [`IndexView`]. Commit turns the
//! stage into a single sled batch; dropping the transaction throws it
//! away, which is how a cancelled scan discards its in-progress batch.

use crate::store::{
    asset_key, dir_prefix, file_key, hash_key, owner_key, IndexStore, StoreError,
};
use crate::view::IndexView;
use sled::Batch;
use tracing::debug;
use std::collections::{BTreeMap, BTreeSet};
use trove_core::{AssetId, AssetRecord, ContentHash, FileRecord, LibraryId};

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub files_written: usize,
    pub files_removed: usize,
    pub assets_written: usize,
    pub assets_removed: usize,
}

impl CommitStats {
    pub fn mutations(&self) -> usize {
        self.files_written + self.files_removed + self.assets_written + self.assets_removed
    }
}

pub struct IndexTxn<'a> {
    store: &'a IndexStore,
    library: LibraryId,
    files: BTreeMap<String, Option<FileRecord>>,
    assets: BTreeMap<AssetId, Option<AssetRecord>>,
}

impl<'a> IndexTxn<'a> {
    pub(crate) fn new(store: &'a IndexStore, library: LibraryId) -> Self {
        Self {
            store,
            library,
            files: BTreeMap::new(),
            assets: BTreeMap::new(),
        }
    }

    pub fn library(&self) -> &LibraryId {
        &self.library
    }

    /// Stages an insert or update of a file record.
    pub fn put_file(&mut self, record: FileRecord) -> Result<(), StoreError> {
        if record.library != self.library {
            return Err(StoreError::Corrupted(format!(
                "file '{}' belongs to library '{}', not '{}'",
                record.path, record.library, self.library
            )));
        }
        self.files.insert(record.path.clone(), Some(record));
        Ok(())
    }

    /// Stages deletion of the record at `path`.
    pub fn remove_file(&mut self, path: &str) -> Result<(), StoreError> {
        self.files.insert(path.to_string(), None);
        Ok(())
    }

    pub fn put_asset(&mut self, record: AssetRecord) {
        self.assets.insert(record.id, Some(record));
    }

    pub fn remove_asset(&mut self, id: AssetId) {
        self.assets.insert(id, None);
    }

    /// Nothing staged yet.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.assets.is_empty()
    }

    /// Files strictly inside `dir`, including staged changes.
    pub fn files_under(&self, dir: &str) -> Result<Vec<FileRecord>, StoreError> {
        let prefix = dir_prefix(dir);
        let mut merged: BTreeMap<String, FileRecord> = self
            .store
            .files_under(&self.library, dir)?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        for (path, staged) in &self.files {
            if !path.starts_with(&prefix) {
                continue;
            }
            match staged {
                Some(record) => {
                    merged.insert(path.clone(), record.clone());
                }
                None => {
                    merged.remove(path);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Applies everything staged as one atomic sled batch.
    pub fn commit(self) -> Result<CommitStats, StoreError> {
        let mut stats = CommitStats::default();
        if self.is_empty() {
            return Ok(stats);
        }

        let mut batch = Batch::default();
        for (path, staged) in &self.files {
            // Secondary index entries of the previous version go first
            if let Some(old) = self.store.file(&self.library, path)? {
                batch.remove(hash_key(&self.library, &old.hash, path).as_bytes());
                if let Some(asset) = old.asset {
                    batch.remove(owner_key(&asset, &self.library, path).as_bytes());
                }
            }

            let key = file_key(&self.library, path);
            match staged {
                Some(record) => {
                    batch.insert(key.as_bytes(), bincode::serialize(record)?);
                    batch.insert(
                        hash_key(&self.library, &record.hash, path).as_bytes(),
                        &[] as &[u8],
                    );
                    if let Some(asset) = record.asset {
                        batch.insert(
                            owner_key(&asset, &self.library, path).as_bytes(),
                            &[] as &[u8],
                        );
                    }
                    stats.files_written += 1;
                }
                None => {
                    batch.remove(key.as_bytes());
                    stats.files_removed += 1;
                }
            }
        }

        for (id, staged) in &self.assets {
            let key = asset_key(id);
            match staged {
                Some(record) => {
                    batch.insert(key.as_bytes(), bincode::serialize(record)?);
                    stats.assets_written += 1;
                }
                None => {
                    batch.remove(key.as_bytes());
                    stats.assets_removed += 1;
                }
            }
        }

        self.store.db().apply_batch(batch)?;
        self.store.db().flush()?;
        debug!("Committed {:?} for library {}", stats, self.library);
        Ok(stats)
    }
}

impl IndexView for IndexTxn<'_> {
    fn file(&self, library: &LibraryId, path: &str) -> Result<Option<FileRecord>, StoreError> {
        if library == &self.library {
            if let Some(staged) = self.files.get(path) {
                return Ok(staged.clone());
            }
        }
        self.store.file(library, path)
    }

    fn files_with_hash(
        &self,
        library: &LibraryId,
        hash: &ContentHash,
    ) -> Result<Vec<FileRecord>, StoreError> {
        if library != &self.library {
            return self.store.files_with_hash(library, hash);
        }
        let mut paths: BTreeSet<String> =
            self.store.paths_with_hash(library, hash)?.into_iter().collect();
        paths.extend(
            self.files
                .iter()
                .filter(|(_, staged)| staged.as_ref().is_some_and(|r| &r.hash == hash))
                .map(|(path, _)| path.clone()),
        );

        let mut files = Vec::new();
        for path in paths {
            if let Some(record) = self.file(library, &path)? {
                if &record.hash == hash {
                    files.push(record);
                }
            }
        }
        Ok(files)
    }

    fn asset(&self, id: AssetId) -> Result<Option<AssetRecord>, StoreError> {
        if let Some(staged) = self.assets.get(&id) {
            return Ok(staged.clone());
        }
        self.store.asset(id)
    }

    fn asset_files(&self, id: AssetId) -> Result<Vec<FileRecord>, StoreError> {
        let mut keys: BTreeSet<(LibraryId, String)> =
            self.store.owned_paths(&id)?.into_iter().collect();
        keys.extend(
            self.files
                .iter()
                .filter(|(_, staged)| staged.as_ref().is_some_and(|r| r.asset == Some(id)))
                .map(|(path, _)| (self.library.clone(), path.clone())),
        );

        let mut files = Vec::new();
        for (library, path) in keys {
            if let Some(record) = self.file(&library, &path)? {
                if record.asset == Some(id) {
                    files.push(record);
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trove_core::{AssetVariant, FileState};

    fn indexed(library: &LibraryId, path: &str, content: &[u8]) -> FileRecord {
        let mut record = FileRecord::hashed(
            library.clone(),
            path,
            ContentHash::of_bytes(content),
            content.len() as u64,
            1,
        );
        record.state = FileState::Indexed;
        record
    }

    #[test]
    fn test_reads_see_staged_writes() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let lib = LibraryId::new("lib");

        let mut txn = store.begin(&lib);
        txn.put_file(indexed(&lib, "a.txt", b"hi")).unwrap();
        assert!(txn.file(&lib, "a.txt").unwrap().is_some());
        assert!(store.file(&lib, "a.txt").unwrap().is_none());

        let hash = ContentHash::of_bytes(b"hi");
        assert_eq!(txn.files_with_hash(&lib, &hash).unwrap().len(), 1);

        txn.remove_file("a.txt").unwrap();
        assert!(txn.file(&lib, "a.txt").unwrap().is_none());
        assert!(txn.files_with_hash(&lib, &hash).unwrap().is_empty());
    }

    #[test]
    fn test_dropped_transaction_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let lib = LibraryId::new("lib");

        {
            let mut txn = store.begin(&lib);
            txn.put_file(indexed(&lib, "a.txt", b"hi")).unwrap();
            txn.put_asset(AssetRecord::claimed(lib.clone(), AssetVariant::Photo));
        }

        assert!(store.files(&lib).unwrap().is_empty());
        assert!(store.assets(&lib).unwrap().is_empty());
    }

    #[test]
    fn test_commit_stats() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let lib = LibraryId::new("lib");

        let mut txn = store.begin(&lib);
        txn.put_file(indexed(&lib, "a.txt", b"a")).unwrap();
        txn.put_file(indexed(&lib, "b.txt", b"b")).unwrap();
        let stats = txn.commit().unwrap();
        assert_eq!(stats.files_written, 2);

        let mut txn = store.begin(&lib);
        txn.remove_file("a.txt").unwrap();
        let stats = txn.commit().unwrap();
        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.mutations(), 1);
        assert_eq!(store.files(&lib).unwrap().len(), 1);

        assert_eq!(store.begin(&lib).commit().unwrap().mutations(), 0);
    }

    #[test]
    fn test_put_file_rejects_foreign_library() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let mut txn = store.begin(&LibraryId::new("one"));
        let foreign = indexed(&LibraryId::new("two"), "a.txt", b"a");
        assert!(txn.put_file(foreign).is_err());
    }
}
