use crate::cache::RenditionCache;
use trove_core::ContentHash;
use trove_store::IndexView;
use trove_watcher::{HandlerAction, HandlerError, Signal, SignalHandler, SignalKind};

/// Drops renditions of content no file in the library carries anymore.
///
/// Register it for `file-available` and `asset-removed` in every
/// context whose assets are rendered. It never asks for an index
/// change.
pub struct RenditionInvalidator {
    cache: RenditionCache,
}

impl RenditionInvalidator {
    pub fn new(cache: RenditionCache) -> Self {
        Self { cache }
    }

    fn drop_if_unused(
        &self,
        signal: &Signal,
        hash: &ContentHash,
        index: &dyn IndexView,
    ) -> Result<(), HandlerError> {
        let still_used = index
            .files_with_hash(&signal.library, hash)?
            .iter()
            .any(|f| f.is_available());
        if !still_used {
            self.cache
                .invalidate(hash)
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
        }
        Ok(())
    }
}

impl SignalHandler for RenditionInvalidator {
    fn name(&self) -> &str {
        "rendition-invalidator"
    }

    fn handle(
        &self,
        signal: &Signal,
        index: &dyn IndexView,
    ) -> Result<HandlerAction, HandlerError> {
        match signal.kind {
            SignalKind::FileAvailable => {
                if let Some(previous) = signal.previous_hash.filter(|h| *h != signal.hash) {
                    self.drop_if_unused(signal, &previous, index)?;
                }
            }
            SignalKind::AssetRemoved => self.drop_if_unused(signal, &signal.hash, index)?,
            _ => {}
        }
        Ok(HandlerAction::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, RenditionGenerator, RenditionSource, RenditionSpec};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::tempdir;
    use trove_core::{FileRecord, FileState, LibraryId};
    use trove_store::IndexStore;

    struct Echo;

    #[async_trait]
    impl RenditionGenerator for Echo {
        async fn render(
            &self,
            source: &RenditionSource,
            _spec: &RenditionSpec,
        ) -> Result<Vec<u8>, CacheError> {
            Ok(source.path.clone().into_bytes())
        }
    }

    fn signal(kind: SignalKind, path: &str, hash: ContentHash, previous: Option<ContentHash>) -> Signal {
        Signal {
            kind,
            library: LibraryId::new("lib"),
            context: "gallery".to_string(),
            path: path.to_string(),
            hash,
            available: kind == SignalKind::FileAvailable,
            previous_hash: previous,
            previous_path: None,
            asset: None,
        }
    }

    fn put(store: &IndexStore, path: &str, content: &[u8]) {
        let lib = LibraryId::new("lib");
        let mut record = FileRecord::hashed(
            lib.clone(),
            path,
            ContentHash::of_bytes(content),
            content.len() as u64,
            1,
        );
        record.state = FileState::Indexed;
        let mut txn = store.begin(&lib);
        txn.put_file(record).unwrap();
        txn.commit().unwrap();
    }

    async fn cached(cache: &RenditionCache, content: &[u8]) {
        let source = RenditionSource {
            library: LibraryId::new("lib"),
            path: "x".to_string(),
            hash: ContentHash::of_bytes(content),
        };
        cache
            .render_source(&source, &RenditionSpec::new("thumb"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_modified_content_drops_old_renditions() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let cache = RenditionCache::open(store.clone(), Arc::new(Echo)).unwrap();
        cached(&cache, b"hi").await;
        put(&store, "a.txt", b"bye");

        let handler = RenditionInvalidator::new(cache.clone());
        let old = ContentHash::of_bytes(b"hi");
        let action = handler
            .handle(
                &signal(SignalKind::FileAvailable, "a.txt", ContentHash::of_bytes(b"bye"), Some(old)),
                &store,
            )
            .unwrap();

        assert_eq!(action, HandlerAction::None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_shared_content_keeps_renditions() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let cache = RenditionCache::open(store.clone(), Arc::new(Echo)).unwrap();
        cached(&cache, b"hi").await;
        put(&store, "a.txt", b"bye");
        put(&store, "copy.txt", b"hi");

        let handler = RenditionInvalidator::new(cache.clone());
        handler
            .handle(
                &signal(
                    SignalKind::FileAvailable,
                    "a.txt",
                    ContentHash::of_bytes(b"bye"),
                    Some(ContentHash::of_bytes(b"hi")),
                ),
                &store,
            )
            .unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_asset_removed_and_other_signals() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        let cache = RenditionCache::open(store.clone(), Arc::new(Echo)).unwrap();
        cached(&cache, b"gone").await;
        let handler = RenditionInvalidator::new(cache.clone());
        let hash = ContentHash::of_bytes(b"gone");

        // A file going missing may come back, so nothing is dropped yet
        handler
            .handle(&signal(SignalKind::FileUnavailable, "a", hash, None), &store)
            .unwrap();
        assert_eq!(cache.len(), 1);

        handler
            .handle(&signal(SignalKind::AssetRemoved, "a", hash, None), &store)
            .unwrap();
        assert!(cache.is_empty());
    }
}
