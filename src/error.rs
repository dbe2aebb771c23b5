//! Error Module
//! Failure taxonomy shared by the cache stores, downloader and responder

use thiserror::Error;

use crate::extractor::ExtractError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{0}")]
    Validation(String),
    #[error("download already in progress for {0}")]
    InProgress(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("cache usage {usage_percent:.1}% is at or above the {threshold_percent}% admission threshold")]
    QuotaExceeded {
        usage_percent: f64,
        threshold_percent: u32,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Short message safe to hand to HTTP clients.
    pub fn public_message(&self) -> String {
        match self {
            CacheError::Validation(msg) => msg.clone(),
            CacheError::InProgress(_) => "download already in progress".to_string(),
            CacheError::Extraction(e) => e.summary().to_string(),
            CacheError::QuotaExceeded { .. } => "audio cache is full".to_string(),
            CacheError::Database(_) | CacheError::Io(_) => "internal error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
