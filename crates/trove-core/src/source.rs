//! Source addressing: `<backend>://<backend-specific-config>`.

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A parsed source URI such as `file:///srv/photos`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceUri {
    scheme: String,
    location: String,
}

impl SourceUri {
    /// Builds a `file://` URI for an absolute directory.
    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self {
            scheme: "file".to_string(),
            location: root.into().display().to_string(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after `://`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The local root for `file://` sources.
    pub fn file_path(&self) -> Option<PathBuf> {
        (self.scheme == "file").then(|| PathBuf::from(&self.location))
    }
}

fn valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl FromStr for SourceUri {
    type Err = ConfigError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, location) = uri
            .split_once("://")
            .ok_or_else(|| invalid("expected <backend>://<location>"))?;

        if !valid_scheme(scheme) {
            return Err(invalid("malformed scheme"));
        }
        if location.is_empty() {
            return Err(invalid("empty location"));
        }
        if scheme == "file" && !location.starts_with('/') {
            return Err(invalid("file sources need an absolute path"));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
        })
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.location)
    }
}

impl Serialize for SourceUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
