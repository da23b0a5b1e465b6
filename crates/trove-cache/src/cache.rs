//! Rendition storage with single-flight generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use trove_core::{AssetId, AssetState, ContentHash, LibraryId};
use trove_store::{IndexStore, IndexView, StoreError};

const TREE: &str = "renditions";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("index error: {0}")]
    Store(#[from] StoreError),

    #[error("cache storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("unknown asset: {0}")]
    UnknownAsset(AssetId),

    #[error("asset {0} has no available file")]
    NoAvailableFile(AssetId),

    #[error("rendition generation failed: {0}")]
    Generation(String),
}

/// Describes one derived representation, like "thumbnail at 256px".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl RenditionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable textual form. Parameters are sorted, so two specs with
    /// the same parameters always share a key.
    pub fn key(&self) -> String {
        if self.params.is_empty() {
            return self.name.clone();
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}?{}", self.name, params.join("&"))
    }
}

/// The file a rendition is made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionSource {
    pub library: LibraryId,
    pub path: String,
    pub hash: ContentHash,
}

/// Produces rendition bytes. Supplied by the embedding application.
#[async_trait]
pub trait RenditionGenerator: Send + Sync {
    async fn render(
        &self,
        source: &RenditionSource,
        spec: &RenditionSpec,
    ) -> Result<Vec<u8>, CacheError>;
}

type Outcome = Result<Arc<Vec<u8>>, String>;

struct Inner {
    store: IndexStore,
    tree: sled::Tree,
    generator: Arc<dyn RenditionGenerator>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Outcome>>>>,
}

/// Cache of renditions keyed by `(content hash, spec)`.
///
/// Concurrent requests for the same key share one generation.
#[derive(Clone)]
pub struct RenditionCache {
    inner: Arc<Inner>,
}

impl RenditionCache {
    /// Opens the cache in its own tree of the index database.
    pub fn open(
        store: IndexStore,
        generator: Arc<dyn RenditionGenerator>,
    ) -> Result<Self, CacheError> {
        let tree = store.open_tree(TREE)?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                tree,
                generator,
                inflight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Cached bytes, without generating anything.
    pub fn get(
        &self,
        hash: &ContentHash,
        spec: &RenditionSpec,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let key = entry_key(hash, &spec.key());
        Ok(self.inner.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// The file a rendition of `asset` should be made from: its first
    /// available file by path.
    pub fn resolve(&self, asset: AssetId) -> Result<RenditionSource, CacheError> {
        let record = self
            .inner
            .store
            .asset(asset)?
            .filter(|a| a.state != AssetState::Removed)
            .ok_or(CacheError::UnknownAsset(asset))?;

        let file = self
            .inner
            .store
            .asset_files(record.id)?
            .into_iter()
            .filter(|f| f.is_available())
            .min_by(|a, b| a.path.cmp(&b.path))
            .ok_or(CacheError::NoAvailableFile(asset))?;

        Ok(RenditionSource {
            library: file.library,
            path: file.path,
            hash: file.hash,
        })
    }

    /// Returns the rendition of `asset`, generating and storing it on a
    /// miss.
    pub async fn get_or_render(
        &self,
        asset: AssetId,
        spec: &RenditionSpec,
    ) -> Result<Arc<Vec<u8>>, CacheError> {
        let source = self.resolve(asset)?;
        self.render_source(&source, spec).await
    }

    /// Same as [`get_or_render`](Self::get_or_render) for an already
    /// resolved source file.
    pub async fn render_source(
        &self,
        source: &RenditionSource,
        spec: &RenditionSpec,
    ) -> Result<Arc<Vec<u8>>, CacheError> {
        let key = entry_key(&source.hash, &spec.key());

        if let Some(bytes) = self.inner.tree.get(key.as_bytes())? {
            return Ok(Arc::new(bytes.to_vec()));
        }

        let cell = Arc::clone(
            self.inflight()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let outcome = cell
            .get_or_init(|| self.generate(&key, source, spec))
            .await
            .clone();

        {
            let mut inflight = self.inflight();
            if inflight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(&key);
            }
        }

        outcome.map_err(CacheError::Generation)
    }

    async fn generate(&self, key: &str, source: &RenditionSource, spec: &RenditionSpec) -> Outcome {
        // A previous flight may have finished between our miss and
        // taking the cell.
        match self.inner.tree.get(key.as_bytes()) {
            Ok(Some(bytes)) => return Ok(Arc::new(bytes.to_vec())),
            Ok(None) => {}
            Err(e) => return Err(e.to_string()),
        }

        debug!("Rendering {} for {}", spec.key(), source.path);
        let bytes = self
            .inner
            .generator
            .render(source, spec)
            .await
            .map_err(|e| e.to_string())?;
        self.inner
            .tree
            .insert(key.as_bytes(), bytes.as_slice())
            .map_err(|e| e.to_string())?;
        Ok(Arc::new(bytes))
    }

    /// Drops every rendition made from `hash`. Returns how many.
    pub fn invalidate(&self, hash: &ContentHash) -> Result<usize, CacheError> {
        let prefix = hash_prefix(hash);
        let mut removed = 0;
        for entry in self.inner.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            self.inner.tree.remove(key)?;
            removed += 1;
        }
        if removed > 0 {
            info!("Invalidated {} renditions of {}", removed, hash);
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tree.is_empty()
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<Outcome>>>> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn hash_prefix(hash: &ContentHash) -> String {
    format!("{}\0", hash.to_hex())
}

fn entry_key(hash: &ContentHash, spec: &str) -> String {
    format!("{}{}", hash_prefix(hash), spec)
}
