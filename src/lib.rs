//! Audio cache and streaming engine.
//!
//! Resolves and caches remote media urls, downloads audio into a bounded
//! disk cache, and serves it over HTTP with byte-range support.

pub mod config;
pub mod database;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod media_id;
pub mod quota;
pub mod server;
pub mod streaming;
pub mod url_cache;
