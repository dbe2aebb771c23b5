//! Media Id Module
//! Validated 11-character identifiers used as cache keys

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::CacheError;

static MEDIA_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// An externally-defined media identifier. Construction validates the shape,
/// so anything holding a `MediaId` can safely build paths and URLs from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        if MEDIA_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(CacheError::Validation(format!("invalid media id: {:?}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic location of the cached mp3 for this id.
    pub fn file_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(format!("{}.mp3", self.0))
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MediaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
