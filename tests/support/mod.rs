// Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use audiocast_lib::config::CacheConfig;
use audiocast_lib::database::Database;
use audiocast_lib::extractor::{ExtractError, ExtractionClient};
use audiocast_lib::media_id::MediaId;
use audiocast_lib::server::AppState;
use audiocast_lib::streaming::http_client;

/// What the fake does when asked to download.
pub enum DownloadBehavior {
    Write(usize),
    WriteEmpty,
    Fail,
}

/// Extraction client that counts invocations and never spawns a process.
pub struct FakeExtractor {
    pub downloads: AtomicUsize,
    pub resolves: AtomicUsize,
    behavior: DownloadBehavior,
    resolved_urls: Mutex<VecDeque<String>>,
    gate: Option<Arc<Notify>>,
    after_write: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FakeExtractor {
    pub fn new(behavior: DownloadBehavior) -> Self {
        Self {
            downloads: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            behavior,
            resolved_urls: Mutex::new(VecDeque::new()),
            gate: None,
            after_write: None,
        }
    }

    /// Downloads block until the returned `Notify` is signalled.
    pub fn gated(behavior: DownloadBehavior) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut fake = Self::new(behavior);
        fake.gate = Some(gate.clone());
        (fake, gate)
    }

    /// Urls handed out by successive `resolve_url` calls; the last one repeats.
    pub fn with_urls(self, urls: &[String]) -> Self {
        *self.resolved_urls.lock() = urls.iter().cloned().collect();
        self
    }

    /// Run `hook` once the output file is written, before returning.
    pub fn on_written(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_write = Some(Box::new(hook));
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionClient for FakeExtractor {
    async fn resolve_url(&self, _id: &MediaId) -> Result<String, ExtractError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let mut urls = self.resolved_urls.lock();
        match urls.len() {
            0 => Err(ExtractError::Empty),
            1 => Ok(urls[0].clone()),
            _ => Ok(urls.pop_front().unwrap_or_default()),
        }
    }

    async fn download_to_file(&self, _id: &MediaId, dest: &Path) -> Result<(), ExtractError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match self.behavior {
            DownloadBehavior::Write(len) => {
                tokio::fs::write(dest, pattern(len)).await?;
                if let Some(hook) = &self.after_write {
                    hook();
                }
                Ok(())
            }
            DownloadBehavior::WriteEmpty => {
                tokio::fs::write(dest, b"").await?;
                Ok(())
            }
            DownloadBehavior::Fail => {
                tokio::fs::write(dest, b"partial").await?;
                Err(ExtractError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: "ERROR: video unavailable".to_string(),
                })
            }
        }
    }
}

/// Deterministic content: byte `i` is `i % 251`.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config(cache_root: &Path) -> CacheConfig {
    CacheConfig {
        cache_root: PathBuf::from(cache_root),
        max_cache_bytes: 1024 * 1024,
        ..CacheConfig::default()
    }
}

pub fn test_state(config: CacheConfig, extractor: Arc<FakeExtractor>) -> (AppState, Arc<Mutex<Database>>) {
    let db = Arc::new(Mutex::new(Database::in_memory().unwrap()));
    let http = http_client(&config).unwrap();
    let state = AppState::new(db.clone(), extractor, Arc::new(config), http);
    (state, db)
}
