//! Trove Core - data model and shared vocabulary
//!
//! This crate holds the types every other Trove crate speaks:
//! libraries, indexed files, assets, content hashes and the
//! error taxonomy used when talking to a source backend.
//!
//! # Example
//!
//! ```no_run
//! use trove_core::{ContentHash, SourceUri};
//!
//! let uri: SourceUri = "file:///srv/photos".parse().unwrap();
//! let hash = ContentHash::of_bytes(b"hi");
//! println!("{} -> {}", uri, hash);
//! ```

pub mod config;
pub mod error;
pub mod hash;
pub mod model;
pub mod source;

pub use config::{EngineSettings, LibraryConfig, TroveConfig};
pub use error::{ConfigError, SourceError};
pub use hash::{ContentHash, ContentHasher};
pub use model::{
    AssetId, AssetRecord, AssetState, AssetVariant, FileRecord, FileState, LibraryId,
    LibraryStatus,
};
pub use source::SourceUri;
