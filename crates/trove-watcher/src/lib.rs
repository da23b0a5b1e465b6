//! Trove Watcher - scanning, watching and incremental indexing
//!
//! This crate keeps the index in step with a library's source:
//! - Listing and reading sources through a [`SourceBackend`]
//! - Crawling a tree and hashing only what changed
//! - Watching for live changes and normalizing them
//! - Reconciling everything into the index and signalling handlers
//!
//! [`LibraryEngine`] is the entry point; it wires the pieces together
//! for one library.

mod backend;
mod crawler;
mod engine;
mod events;
mod fs;
mod indexer;
mod signals;
mod watcher;

pub use backend::{
    BackendRegistry, Entry, EntryKind, RawChange, RawEvent, RawKind, RawSink, SourceBackend,
    WatchHandle, WatchPrimitive,
};
pub use crawler::{CancelFlag, CrawlPass, Crawler, Probe, ScanError, ScanStats};
pub use engine::{LibraryEngine, ScanReport, WatchStream};
pub use events::{DiscoveredFile, FileChange, WatchChange};
pub use fs::FileSystemBackend;
pub use indexer::{ApplyReport, Indexer};
pub use signals::{
    Dispatch, HandlerAction, HandlerError, Signal, SignalBus, SignalHandler, SignalKind,
};
pub use watcher::{normalize_batch, WatchTable, Watcher};
