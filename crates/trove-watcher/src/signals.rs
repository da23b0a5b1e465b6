//! In-process signal bus.
//!
//! The indexer publishes a [`Signal`] for every change worth telling
//! asset handlers about. Handlers are registered once at startup per
//! (library context, signal kind) and run synchronously in
//! registration order. One handler failing never stops the others.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use trove_core::{AssetId, AssetVariant, ContentHash, LibraryId};
use trove_store::{IndexView, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// A file is available with (possibly new) content.
    FileAvailable,
    /// An indexed file changed its path; content is unchanged.
    FileMoved,
    FileUnavailable,
    /// An asset lost its last available file.
    AssetOrphaned,
    /// An asset is gone for good.
    AssetRemoved,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::FileAvailable,
        SignalKind::FileMoved,
        SignalKind::FileUnavailable,
        SignalKind::AssetOrphaned,
        SignalKind::AssetRemoved,
    ];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FileAvailable => "file-available",
            Self::FileMoved => "file-moved",
            Self::FileUnavailable => "file-unavailable",
            Self::AssetOrphaned => "asset-orphaned",
            Self::AssetRemoved => "asset-removed",
        };
        write!(f, "{}", s)
    }
}

/// A typed notification published by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub library: LibraryId,
    pub context: String,

    /// The file concerned. For asset signals, the file whose change
    /// triggered it.
    pub path: String,

    pub hash: ContentHash,

    pub available: bool,

    /// Content before a modification.
    pub previous_hash: Option<ContentHash>,

    /// Path before a move.
    pub previous_path: Option<String>,

    pub asset: Option<AssetId>,
}

/// What a handler wants done after looking at a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    None,
    /// Create a new asset of this variant backed by the file.
    Claim(AssetVariant),
    /// Back an existing asset with the file. This is how handlers
    /// deduplicate files with equal content.
    Attach(AssetId),
    /// Detach the file from its asset.
    Release,
    /// Delete the signal's asset and detach all of its files.
    RemoveAsset,
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("index lookup failed: {0}")]
    Store(#[from] StoreError),

    #[error("handler panicked")]
    Panicked,
}

/// Reacts to signals for one library context.
pub trait SignalHandler: Send + Sync {
    /// Shown in logs.
    fn name(&self) -> &str;

    fn handle(&self, signal: &Signal, index: &dyn IndexView)
        -> Result<HandlerAction, HandlerError>;
}

/// Outcome of delivering one signal.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Actions from handlers that succeeded, in registration order.
    pub actions: Vec<(String, HandlerAction)>,
    /// Names of handlers that failed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl Dispatch {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

type Route = (String, SignalKind);

/// Ordered handler table keyed by (context, kind).
#[derive(Default, Clone)]
pub struct SignalBus {
    routes: HashMap<Route, Vec<Arc<dyn SignalHandler>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list for `(context, kind)`.
    pub fn register(
        &mut self,
        context: impl Into<String>,
        kind: SignalKind,
        handler: Arc<dyn SignalHandler>,
    ) {
        self.routes
            .entry((context.into(), kind))
            .or_default()
            .push(handler);
    }

    /// Registers `handler` for every signal kind in `context`.
    pub fn register_all(&mut self, context: &str, handler: Arc<dyn SignalHandler>) {
        for kind in SignalKind::ALL {
            self.register(context, kind, Arc::clone(&handler));
        }
    }

    pub fn handler_count(&self, context: &str, kind: SignalKind) -> usize {
        self.routes
            .get(&(context.to_string(), kind))
            .map_or(0, Vec::len)
    }

    /// Delivers `signal` to each matching handler in order.
    pub fn dispatch(&self, signal: &Signal, index: &dyn IndexView) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some(handlers) = self.routes.get(&(signal.context.clone(), signal.kind)) else {
            return dispatch;
        };

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler.handle(signal, index)))
                .unwrap_or(Err(HandlerError::Panicked));
            match result {
                Ok(action) => {
                    debug!(
                        "{} answered {} for '{}' with {:?}",
                        handler.name(),
                        signal.kind,
                        signal.path,
                        action
                    );
                    dispatch.actions.push((handler.name().to_string(), action));
                }
                Err(e) => {
                    warn!(
                        "Handler {} failed on {} for '{}': {}",
                        handler.name(),
                        signal.kind,
                        signal.path,
                        e
                    );
                    dispatch
                        .failures
                        .push((handler.name().to_string(), e.to_string()));
                }
            }
        }
        dispatch
    }
}
