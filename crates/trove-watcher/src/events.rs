//! The event vocabulary shared by crawling and watching.
//!
//! Whatever noticed a change, the indexer only ever sees a
//! [`FileChange`]. Content-bearing changes arrive already hashed.

use trove_core::ContentHash;

/// A file whose bytes have been read and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: String,
    pub size: u64,
    pub mtime_ns: i64,
    pub hash: ContentHash,
}

/// A normalized discovered-file event, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// A file exists with this content (new, modified or unchanged).
    Discovered(DiscoveredFile),

    /// Metadata is unchanged, but a handler failed on this file last
    /// time and it needs another look.
    Reevaluate { path: String },

    /// The file is gone.
    Removed { path: String },

    /// Renamed within the library; content unchanged.
    Moved { from: String, to: String },

    /// Everything under this directory is gone.
    DirectoryRemoved { path: String },

    /// Directory renamed within the library.
    DirectoryMoved { from: String, to: String },
}

impl FileChange {
    /// The path this change is about (the destination for moves).
    pub fn path(&self) -> &str {
        match self {
            Self::Discovered(file) => &file.path,
            Self::Reevaluate { path } | Self::Removed { path } | Self::DirectoryRemoved { path } => {
                path
            }
            Self::Moved { to, .. } | Self::DirectoryMoved { to, .. } => to,
        }
    }
}

/// What the watcher makes of a batch of raw notifications. Created and
/// modified files still need to be hashed before they become
/// [`FileChange`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChange {
    Created(String),
    Modified(String),
    Deleted(String),
    Moved { from: String, to: String },
    DirCreated(String),
    DirRemoved(String),
    DirMoved { from: String, to: String },
    /// Notifications were lost; coverage can't be trusted anymore.
    Overflow,
}
