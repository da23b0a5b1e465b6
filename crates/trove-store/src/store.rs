use crate::txn::IndexTxn;
use crate::view::IndexView;
use sled::Db;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use trove_core::{AssetId, AssetRecord, ContentHash, FileRecord, LibraryId, LibraryStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

const SEP: char = '\0';

// Key layout, all in the default tree:
//   f:<library>\0<path>                 -> FileRecord
//   h:<library>\0<hash>\0<path>         -> ()   files by content hash
//   o:<asset>\0<library>\0<path>        -> ()   files owned by an asset
//   a:<asset>                           -> AssetRecord
//   s:<library>                         -> LibraryStatus
pub(crate) fn file_key(library: &LibraryId, path: &str) -> String {
    format!("f:{}{}{}", library, SEP, path)
}

pub(crate) fn file_prefix(library: &LibraryId) -> String {
    format!("f:{}{}", library, SEP)
}

pub(crate) fn hash_key(library: &LibraryId, hash: &ContentHash, path: &str) -> String {
    format!("{}{}", hash_prefix(library, hash), path)
}

pub(crate) fn hash_prefix(library: &LibraryId, hash: &ContentHash) -> String {
    format!("h:{}{}{}{}", library, SEP, hash.to_hex(), SEP)
}

pub(crate) fn owner_key(asset: &AssetId, library: &LibraryId, path: &str) -> String {
    format!("o:{}{}{}{}{}", asset, SEP, library, SEP, path)
}

pub(crate) fn owner_prefix(asset: &AssetId) -> String {
    format!("o:{}{}", asset, SEP)
}

pub(crate) fn asset_key(asset: &AssetId) -> String {
    format!("a:{}", asset)
}

fn status_key(library: &LibraryId) -> String {
    format!("s:{}", library)
}

/// The persisted File/Asset index.
///
/// Cloning is cheap; all clones share the same database handle.
#[derive(Clone)]
pub struct IndexStore {
    db: Db,
}

impl IndexStore {
    /// Opens or creates an index at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Starts a staged transaction for one library. Nothing is written
    /// until [`IndexTxn::commit`]; dropping the transaction discards it.
    pub fn begin(&self, library: &LibraryId) -> IndexTxn<'_> {
        IndexTxn::new(self, library.clone())
    }

    /// Opens a named tree next to the index, for collaborators like
    /// the rendition cache.
    pub fn open_tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    /// Blocks until everything written so far is durable.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All files of a library, keyed by path.
    pub fn files(&self, library: &LibraryId) -> Result<HashMap<String, FileRecord>, StoreError> {
        let mut files = HashMap::new();
        for item in self.db.scan_prefix(file_prefix(library).as_bytes()) {
            let (_key, value) = item?;
            let record: FileRecord = bincode::deserialize(&value)?;
            files.insert(record.path.clone(), record);
        }
        Ok(files)
    }

    /// Files whose path lies strictly inside `dir`.
    pub fn files_under(&self, library: &LibraryId, dir: &str) -> Result<Vec<FileRecord>, StoreError> {
        let prefix = format!("{}{}", file_prefix(library), dir_prefix(dir));
        let mut files = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = item?;
            files.push(bincode::deserialize(&value)?);
        }
        Ok(files)
    }

    pub(crate) fn paths_with_hash(
        &self,
        library: &LibraryId,
        hash: &ContentHash,
    ) -> Result<Vec<String>, StoreError> {
        let prefix = hash_prefix(library, hash);
        let mut paths = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            paths.push(key_suffix(&key, prefix.len())?);
        }
        Ok(paths)
    }

    pub(crate) fn owned_paths(&self, asset: &AssetId) -> Result<Vec<(LibraryId, String)>, StoreError> {
        let prefix = owner_prefix(asset);
        let mut owned = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let rest = key_suffix(&key, prefix.len())?;
            let (library, path) = rest
                .split_once(SEP)
                .ok_or_else(|| StoreError::Corrupted(format!("bad owner key '{}'", rest)))?;
            owned.push((LibraryId::new(library), path.to_string()));
        }
        Ok(owned)
    }

    /// All assets belonging to a library.
    pub fn assets(&self, library: &LibraryId) -> Result<Vec<AssetRecord>, StoreError> {
        let mut assets = Vec::new();
        for item in self.db.scan_prefix(b"a:") {
            let (_key, value) = item?;
            let record: AssetRecord = bincode::deserialize(&value)?;
            if &record.library == library {
                assets.push(record);
            }
        }
        Ok(assets)
    }

    pub fn status(&self, library: &LibraryId) -> Result<LibraryStatus, StoreError> {
        Ok(self
            .get_decoded(&status_key(library))?
            .unwrap_or_default())
    }

    pub fn set_status(&self, library: &LibraryId, status: &LibraryStatus) -> Result<(), StoreError> {
        self.db
            .insert(status_key(library).as_bytes(), bincode::serialize(status)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// Read-modify-write of a library's status.
    pub fn update_status<F>(&self, library: &LibraryId, f: F) -> Result<LibraryStatus, StoreError>
    where
        F: FnOnce(&mut LibraryStatus),
    {
        let mut status = self.status(library)?;
        f(&mut status);
        self.set_status(library, &status)?;
        Ok(status)
    }

    /// Removes every record of a library.
    pub fn clear_library(&self, library: &LibraryId) -> Result<(), StoreError> {
        let mut txn = self.begin(library);
        for path in self.files(library)?.into_keys() {
            txn.remove_file(&path)?;
        }
        for asset in self.assets(library)? {
            txn.remove_asset(asset.id);
        }
        txn.commit()?;
        self.db.remove(status_key(library).as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

impl IndexView for IndexStore {
    fn file(&self, library: &LibraryId, path: &str) -> Result<Option<FileRecord>, StoreError> {
        self.get_decoded(&file_key(library, path))
    }

    fn files_with_hash(
        &self,
        library: &LibraryId,
        hash: &ContentHash,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let mut files = Vec::new();
        for path in self.paths_with_hash(library, hash)? {
            if let Some(record) = self.file(library, &path)? {
                files.push(record);
            }
        }
        Ok(files)
    }

    fn asset(&self, id: AssetId) -> Result<Option<AssetRecord>, StoreError> {
        self.get_decoded(&asset_key(&id))
    }

    fn asset_files(&self, id: AssetId) -> Result<Vec<FileRecord>, StoreError> {
        let mut files = Vec::new();
        for (library, path) in self.owned_paths(&id)? {
            if let Some(record) = self.file(&library, &path)? {
                files.push(record);
            }
        }
        Ok(files)
    }
}

/// `dir` with exactly one trailing slash, so `a/b` never matches `a/bc`.
pub(crate) fn dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn key_suffix(key: &[u8], skip: usize) -> Result<String, StoreError> {
    let raw = key
        .get(skip..)
        .ok_or_else(|| StoreError::Corrupted("truncated key".to_string()))?;
    String::from_utf8(raw.to_vec()).map_err(|e| StoreError::Corrupted(e.to_string()))
}
