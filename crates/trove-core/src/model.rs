//! Persisted records and their lifecycles.
//!
//! A File is one filesystem object inside a library, identified by its
//! path. An Asset is the logical thing (a photo, a video) that one or
//! more Files back. The indexer owns Files; Assets only change in
//! response to what handlers decide.

use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a configured library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryId(String);

impl LibraryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LibraryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(Uuid);

impl AssetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a file is in its lifecycle.
///
/// ```text
/// Unknown -> Discovered -> Hashed -> Indexed -> Missing -> Purged
///                            ^          |          |
///                            +----------+----------+
/// ```
///
/// Only `Indexed` and `Missing` are ever persisted. `Purged` means the
/// row is gone; the earlier states live inside a scan pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Unknown,
    /// Seen by a crawl or watch event, content not read yet.
    Discovered,
    /// Content hashed, not reconciled into the index yet.
    Hashed,
    /// Reconciled and available.
    Indexed,
    /// Deleted or no longer seen, waiting out the confirmation window.
    Missing,
    Purged,
}

impl FileState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_become(self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Unknown, Discovered)
                | (Discovered, Hashed)
                | (Hashed, Indexed)
                | (Indexed, Missing)
                | (Indexed, Hashed)
                | (Missing, Hashed)
                | (Missing, Purged)
        )
    }

    pub fn is_available(self) -> bool {
        self == FileState::Indexed
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Discovered => "discovered",
            Self::Hashed => "hashed",
            Self::Indexed => "indexed",
            Self::Missing => "missing",
            Self::Purged => "purged",
        };
        write!(f, "{}", s)
    }
}

/// One indexed file. The natural key is `(library, path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub library: LibraryId,

    /// Path relative to the library root, `/`-separated.
    pub path: String,

    pub hash: ContentHash,

    /// Hash before the most recent content change, if any.
    pub previous_hash: Option<ContentHash>,

    pub size: u64,

    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,

    pub state: FileState,

    /// When the file went missing. Drives purging.
    pub missing_since: Option<DateTime<Utc>>,

    /// The asset currently backed by this file.
    pub asset: Option<AssetId>,

    /// Set when a handler failed on this file. The next scan
    /// re-delivers it even if its metadata did not change.
    pub needs_reevaluation: bool,

    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// A freshly hashed file that has not been reconciled yet.
    pub fn hashed(
        library: LibraryId,
        path: impl Into<String>,
        hash: ContentHash,
        size: u64,
        mtime_ns: i64,
    ) -> Self {
        Self {
            library,
            path: path.into(),
            hash,
            previous_hash: None,
            size,
            mtime_ns,
            state: FileState::Hashed,
            missing_since: None,
            asset: None,
            needs_reevaluation: false,
            updated_at: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.is_available()
    }

    /// Cheap metadata comparison. When this holds we skip hashing.
    pub fn metadata_matches(&self, size: u64, mtime_ns: i64) -> bool {
        self.size == size && self.mtime_ns == mtime_ns
    }
}

/// Which kind of asset a handler decided a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetVariant {
    Photo,
    Video,
    Generic,
}

impl fmt::Display for AssetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

/// Asset lifecycle, driven by handlers rather than by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Claimed,
    /// No available file backs the asset anymore.
    Orphaned,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: AssetId,
    pub library: LibraryId,
    pub variant: AssetVariant,
    pub state: AssetState,

    /// One of its files changed content; handlers should look again.
    pub needs_reevaluation: bool,

    pub created_at: DateTime<Utc>,
}

impl AssetRecord {
    pub fn claimed(library: LibraryId, variant: AssetVariant) -> Self {
        Self {
            id: AssetId::new(),
            library,
            variant,
            state: AssetState::Claimed,
            needs_reevaluation: false,
            created_at: Utc::now(),
        }
    }
}

/// Persisted per-library bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryStatus {
    /// Watch coverage can no longer be trusted; a full rescan is due.
    pub watch_degraded: bool,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_full_scan: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
