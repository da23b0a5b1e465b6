//! Trove Cache - derived renditions keyed by content
//!
//! Renditions (thumbnails, previews, transcodes) are stored under the
//! content hash of the file they were made from plus a rendition spec.
//! Equal content therefore shares renditions, and a file whose content
//! changes simply stops hitting the old entries.
//!
//! How a rendition is produced is up to the embedding application; it
//! plugs in a [`RenditionGenerator`].

mod cache;
mod invalidate;

pub use cache::{CacheError, RenditionCache, RenditionGenerator, RenditionSource, RenditionSpec};
pub use invalidate::RenditionInvalidator;
