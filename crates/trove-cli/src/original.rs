//! The one rendition the CLI can produce by itself: the file's bytes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use trove_cache::{CacheError, RenditionGenerator, RenditionSource, RenditionSpec};
use trove_core::{ContentHash, LibraryId, SourceError};
use trove_watcher::SourceBackend;

pub const ORIGINAL: &str = "original";

/// Serves `original` renditions straight from each library's source.
pub struct OriginalRenditions {
    backends: HashMap<LibraryId, Arc<dyn SourceBackend>>,
}

impl OriginalRenditions {
    pub fn new(backends: HashMap<LibraryId, Arc<dyn SourceBackend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl RenditionGenerator for OriginalRenditions {
    async fn render(
        &self,
        source: &RenditionSource,
        spec: &RenditionSpec,
    ) -> Result<Vec<u8>, CacheError> {
        if spec.name != ORIGINAL {
            return Err(CacheError::Generation(format!(
                "no generator for '{}' renditions",
                spec.key()
            )));
        }
        let backend = self.backends.get(&source.library).cloned().ok_or_else(|| {
            CacheError::Generation(format!("library {} is not loaded", source.library))
        })?;

        let path = source.path.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            let mut reader = backend.open(&path)?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(|e| SourceError::from_io(path.as_str(), e))?;
            Ok::<_, SourceError>(bytes)
        })
        .await
        .map_err(|e| CacheError::Generation(e.to_string()))?
        .map_err(|e| CacheError::Generation(e.to_string()))?;

        // The index may lag behind the source; never cache bytes under
        // a hash they do not have.
        if ContentHash::of_bytes(&bytes) != source.hash {
            return Err(CacheError::Generation(format!(
                "{} changed since it was indexed",
                source.path
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trove_core::{EngineSettings, SourceUri};
    use trove_watcher::FileSystemBackend;

    fn generator(root: &std::path::Path) -> OriginalRenditions {
        let backend = FileSystemBackend::from_uri(&SourceUri::file(root), &EngineSettings::default())
            .unwrap();
        let mut backends: HashMap<LibraryId, Arc<dyn SourceBackend>> = HashMap::new();
        backends.insert(LibraryId::new("lib"), Arc::new(backend));
        OriginalRenditions::new(backends)
    }

    fn source(path: &str, content: &[u8]) -> RenditionSource {
        RenditionSource {
            library: LibraryId::new("lib"),
            path: path.to_string(),
            hash: ContentHash::of_bytes(content),
        }
    }

    #[tokio::test]
    async fn test_renders_original_bytes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let generator = generator(dir.path());

        let bytes = generator
            .render(&source("a.txt", b"hi"), &RenditionSpec::new(ORIGINAL))
            .await
            .unwrap();
        assert_eq!(bytes, b"hi");
    }

    #[tokio::test]
    async fn test_rejects_stale_content_and_unknown_specs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"bye").unwrap();
        let generator = generator(dir.path());

        assert!(generator
            .render(&source("a.txt", b"hi"), &RenditionSpec::new(ORIGINAL))
            .await
            .is_err());
        assert!(generator
            .render(&source("a.txt", b"bye"), &RenditionSpec::new("thumbnail"))
            .await
            .is_err());
    }
}
