use crate::store::StoreError;
use trove_core::{AssetId, AssetRecord, ContentHash, FileRecord, LibraryId};

/// Read access to the index.
///
/// Handlers get one of these when a signal is delivered so they can
/// look at what else is on record (for example every file sharing a
/// content hash) before deciding what to do.
pub trait IndexView {
    fn file(&self, library: &LibraryId, path: &str) -> Result<Option<FileRecord>, StoreError>;

    /// Every file of `library` whose content hashes to `hash`,
    /// available or not.
    fn files_with_hash(
        &self,
        library: &LibraryId,
        hash: &ContentHash,
    ) -> Result<Vec<FileRecord>, StoreError>;

    fn asset(&self, id: AssetId) -> Result<Option<AssetRecord>, StoreError>;

    /// Files currently backing an asset.
    fn asset_files(&self, id: AssetId) -> Result<Vec<FileRecord>, StoreError>;

    /// Whether an asset still has at least one available file.
    fn asset_has_available_file(&self, id: AssetId) -> Result<bool, StoreError> {
        Ok(self.asset_files(id)?.iter().any(|f| f.is_available()))
    }
}
