//! Error types shared across Trove.
//!
//! Source errors follow the taxonomy the scanner cares about: some
//! failures skip one path, some are worth retrying, and only an
//! inaccessible root stops a scan outright.

use std::path::PathBuf;
use thiserror::Error;

/// Things that can go wrong when talking to a source backend.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The path does not exist (anymore).
    #[error("path not found: '{0}'")]
    NotFound(String),

    /// We are not allowed to read this path. The path is skipped.
    #[error("permission denied: '{0}'")]
    PermissionDenied(String),

    /// The backend could not be reached. Usually transient, so
    /// callers retry with backoff.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Reading the content failed halfway through.
    #[error("failed to read '{path}': {source}")]
    CorruptRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Per-file I/O took longer than the configured budget.
    #[error("timed out reading '{0}'")]
    Timeout(String),

    /// The backend does not implement this capability.
    #[error("operation not supported by the '{0}' backend")]
    Unsupported(&'static str),
}

impl SourceError {
    /// Maps an I/O error to the matching taxonomy entry for `path`.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::Interrupted => Self::Unavailable(format!("{}: {}", path, err)),
            _ => Self::CorruptRead { path, source: err },
        }
    }

    /// Whether trying again later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Problems with the configuration file or a library definition.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A source URI we could not make sense of.
    #[error("invalid source '{uri}': {reason}")]
    InvalidSource { uri: String, reason: String },

    /// No backend registered for the URI scheme.
    #[error("no source backend registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("duplicate library id '{0}'")]
    DuplicateLibrary(String),

    #[error("could not determine a config directory for this platform")]
    NoConfigDir,
}
