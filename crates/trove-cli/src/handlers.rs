//! Built-in handler family for the `gallery` context.

use std::path::Path;
use tracing::debug;
use trove_core::{AssetState, AssetVariant};
use trove_store::IndexView;
use trove_watcher::{HandlerAction, HandlerError, Signal, SignalHandler, SignalKind};

pub const GALLERY: &str = "gallery";

const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff", "bmp", "avif", "dng",
    "cr2", "cr3", "nef", "arw", "orf", "rw2", "raf",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "mkv", "webm", "avi", "mts", "m2ts", "3gp", "wmv",
];

/// Classifies files by extension and claims one asset per distinct
/// content.
///
/// A file whose content already backs a live asset is attached to that
/// asset instead of getting its own. Orphaned assets are left alone;
/// they are removed once their last file is purged.
pub struct GalleryHandler;

impl GalleryHandler {
    pub fn variant_for(path: &str) -> AssetVariant {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some(e) if PHOTO_EXTENSIONS.contains(&e) => AssetVariant::Photo,
            Some(e) if VIDEO_EXTENSIONS.contains(&e) => AssetVariant::Video,
            _ => AssetVariant::Generic,
        }
    }

    fn on_available(
        &self,
        signal: &Signal,
        index: &dyn IndexView,
    ) -> Result<HandlerAction, HandlerError> {
        if signal.asset.is_some() {
            return Ok(HandlerAction::None);
        }

        let mut twins = index.files_with_hash(&signal.library, &signal.hash)?;
        twins.sort_by(|a, b| a.path.cmp(&b.path));
        for twin in twins.iter().filter(|f| f.path != signal.path) {
            let Some(id) = twin.asset else { continue };
            let live = index
                .asset(id)?
                .is_some_and(|a| a.state != AssetState::Removed);
            if live {
                debug!("Attaching {} to asset {} of {}", signal.path, id, twin.path);
                return Ok(HandlerAction::Attach(id));
            }
        }

        Ok(HandlerAction::Claim(Self::variant_for(&signal.path)))
    }
}

impl SignalHandler for GalleryHandler {
    fn name(&self) -> &str {
        "gallery"
    }

    fn handle(
        &self,
        signal: &Signal,
        index: &dyn IndexView,
    ) -> Result<HandlerAction, HandlerError> {
        match signal.kind {
            SignalKind::FileAvailable => self.on_available(signal, index),
            SignalKind::AssetOrphaned => {
                debug!("Asset of {} is orphaned, keeping it until purge", signal.path);
                Ok(HandlerAction::None)
            }
            _ => Ok(HandlerAction::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trove_core::{AssetRecord, ContentHash, FileRecord, FileState, LibraryId};
    use trove_store::IndexStore;

    fn available(path: &str, content: &[u8]) -> Signal {
        Signal {
            kind: SignalKind::FileAvailable,
            library: LibraryId::new("photos"),
            context: GALLERY.to_string(),
            path: path.to_string(),
            hash: ContentHash::of_bytes(content),
            available: true,
            previous_hash: None,
            previous_path: None,
            asset: None,
        }
    }

    #[test]
    fn test_variant_by_extension() {
        assert_eq!(GalleryHandler::variant_for("2024/IMG_0001.JPG"), AssetVariant::Photo);
        assert_eq!(GalleryHandler::variant_for("clip.mov"), AssetVariant::Video);
        assert_eq!(GalleryHandler::variant_for("notes.txt"), AssetVariant::Generic);
        assert_eq!(GalleryHandler::variant_for("Makefile"), AssetVariant::Generic);
    }

    #[test]
    fn test_claims_new_content() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();

        let action = GalleryHandler
            .handle(&available("a.png", b"pixels"), &store)
            .unwrap();
        assert_eq!(action, HandlerAction::Claim(AssetVariant::Photo));
    }

    #[test]
    fn test_attaches_duplicate_content() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let lib = LibraryId::new("photos");

        let asset = AssetRecord::claimed(lib.clone(), AssetVariant::Photo);
        let id = asset.id;
        let mut original =
            FileRecord::hashed(lib.clone(), "a.png", ContentHash::of_bytes(b"pixels"), 6, 1);
        original.state = FileState::Indexed;
        original.asset = Some(id);
        let mut txn = store.begin(&lib);
        txn.put_asset(asset);
        txn.put_file(original).unwrap();
        txn.commit().unwrap();

        let action = GalleryHandler
            .handle(&available("copy.png", b"pixels"), &store)
            .unwrap();
        assert_eq!(action, HandlerAction::Attach(id));
    }

    #[test]
    fn test_owned_file_and_orphans_are_left_alone() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();

        let mut owned = available("a.png", b"pixels");
        owned.asset = Some(trove_core::AssetId::new());
        assert_eq!(
            GalleryHandler.handle(&owned, &store).unwrap(),
            HandlerAction::None
        );

        let mut orphaned = owned.clone();
        orphaned.kind = SignalKind::AssetOrphaned;
        orphaned.available = false;
        assert_eq!(
            GalleryHandler.handle(&orphaned, &store).unwrap(),
            HandlerAction::None
        );
    }
}
