// Download Orchestrator Module
// Single-flight background downloads into the disk cache.
// A download is claimed with an atomic conditional upsert, so at most one
// extraction runs per media id even across concurrent requests.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::database::{unix_now, AudioFileRecord, Database, DownloadStatus};
use crate::error::{CacheError, Result};
use crate::extractor::{ExtractError, ExtractionClient};
use crate::media_id::MediaId;
use crate::quota::remove_file_quietly;

/// Externally visible state of a media id. `None` means nothing usable is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    None,
    Pending,
    Downloading,
    Ready,
    Error,
}

impl From<DownloadStatus> for MediaStatus {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Pending => MediaStatus::Pending,
            DownloadStatus::Downloading => MediaStatus::Downloading,
            DownloadStatus::Ready => MediaStatus::Ready,
            DownloadStatus::Error => MediaStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: MediaStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusReport {
    fn of(status: MediaStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }
}

enum Claim {
    /// A verified ready file already exists.
    Cached(AudioFileRecord),
    /// This caller now owns the download.
    Claimed,
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    db: Arc<Mutex<Database>>,
    extractor: Arc<dyn ExtractionClient>,
    config: Arc<CacheConfig>,
}

impl DownloadOrchestrator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        extractor: Arc<dyn ExtractionClient>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            db,
            extractor,
            config,
        }
    }

    /// Download `id` and wait for the outcome.
    pub async fn download(&self, id: &MediaId) -> Result<AudioFileRecord> {
        match self.claim(id).await? {
            Claim::Cached(record) => Ok(record),
            Claim::Claimed => self.execute(id).await,
        }
    }

    /// Start a download in the background and report the resulting status
    /// without waiting for it to finish.
    pub async fn trigger(&self, id: &MediaId) -> Result<StatusReport> {
        match self.claim(id).await {
            Ok(Claim::Cached(_)) => Ok(StatusReport::of(MediaStatus::Ready)),
            Ok(Claim::Claimed) => {
                let this = self.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    // Outcome is recorded on the row; polling clients read it there.
                    let _ = this.execute(&id).await;
                });
                Ok(StatusReport::of(MediaStatus::Downloading))
            }
            Err(CacheError::InProgress(_)) => Ok(StatusReport::of(MediaStatus::Downloading)),
            Err(e) => Err(e),
        }
    }

    /// Read-only view of the cache state for `id`.
    pub async fn status(&self, id: &MediaId) -> Result<StatusReport> {
        let record = match self.db.lock().get_audio_file(id.as_str())? {
            Some(record) => record,
            None => return Ok(StatusReport::of(MediaStatus::None)),
        };

        let report = match record.status {
            DownloadStatus::Ready => {
                if file_present(Path::new(&record.file_path)).await {
                    StatusReport::of(MediaStatus::Ready)
                } else {
                    StatusReport::of(MediaStatus::None)
                }
            }
            DownloadStatus::Error => StatusReport {
                status: MediaStatus::Error,
                error_message: record.error_message,
            },
            DownloadStatus::Pending | DownloadStatus::Downloading => {
                StatusReport::of(record.status.into())
            }
        };
        Ok(report)
    }

    /// Ready record for `id` whose file is verified present on disk.
    pub async fn ready_file(&self, id: &MediaId) -> Result<Option<AudioFileRecord>> {
        let record = self.db.lock().get_audio_file(id.as_str())?;
        match record {
            Some(record) if record.status == DownloadStatus::Ready => {
                if file_present(Path::new(&record.file_path)).await {
                    Ok(Some(record))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Move downloads orphaned by a previous process into `error` so they can
    /// be retried. Call once at startup, before serving requests.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let orphaned = self.db.lock().files_with_status(DownloadStatus::Downloading)?;
        let now = unix_now();
        for record in &orphaned {
            remove_file_quietly(Path::new(&record.file_path));
            self.db
                .lock()
                .mark_error(&record.media_id, "download interrupted", now)?;
        }
        if !orphaned.is_empty() {
            log::warn!("marked {} interrupted downloads as failed", orphaned.len());
        }
        Ok(orphaned.len())
    }

    async fn claim(&self, id: &MediaId) -> Result<Claim> {
        let path = id.file_path(&self.config.cache_root);

        let existing = self.db.lock().get_audio_file(id.as_str())?;
        if let Some(record) = existing {
            match record.status {
                DownloadStatus::Downloading => {
                    return Err(CacheError::InProgress(id.to_string()));
                }
                DownloadStatus::Ready => {
                    if file_present(&path).await {
                        return Ok(Claim::Cached(record));
                    }
                    log::warn!("cached file for {} is missing, downloading again", id);
                }
                DownloadStatus::Pending | DownloadStatus::Error => {}
            }
        }

        tokio::fs::create_dir_all(&self.config.cache_root).await?;

        let claimed = self
            .db
            .lock()
            .claim_download(id.as_str(), &path.to_string_lossy(), unix_now())?;
        if claimed {
            Ok(Claim::Claimed)
        } else {
            Err(CacheError::InProgress(id.to_string()))
        }
    }

    async fn execute(&self, id: &MediaId) -> Result<AudioFileRecord> {
        let path = id.file_path(&self.config.cache_root);
        let timeout = self.config.download_timeout();

        // A leftover file would make the extractor skip the download.
        remove_file_quietly(&path);

        log::info!("download started for {}", id);
        let outcome = match tokio::time::timeout(timeout, self.extractor.download_to_file(id, &path)).await {
            Ok(Ok(())) => non_empty_size(&path).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExtractError::Timeout(timeout)),
        };

        let result = match outcome {
            Ok(size) => self.finish(id, size),
            Err(e) => Err(CacheError::Extraction(e)),
        };

        if let Err(e) = &result {
            log::error!("download failed for {}: {}", id, e);
            remove_file_quietly(&path);
            let message = match e {
                CacheError::Extraction(inner) => inner.to_string(),
                other => other.to_string(),
            };
            if let Err(db_err) = self.db.lock().mark_error(id.as_str(), &message, unix_now()) {
                log::error!("failed to record download error for {}: {}", id, db_err);
            }
        }
        result
    }

    /// Record a completed download as ready and return the stored record.
    fn finish(&self, id: &MediaId, size: u64) -> Result<AudioFileRecord> {
        let db = self.db.lock();
        let record = if db.mark_ready(id.as_str(), size as i64, unix_now())? {
            db.get_audio_file(id.as_str())?
        } else {
            None
        };
        let record = record.ok_or_else(|| {
            CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("record for {} removed during download", id),
            ))
        })?;
        log::info!("download finished for {} ({} bytes)", id, size);
        Ok(record)
    }
}

async fn file_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn non_empty_size(path: &Path) -> std::result::Result<u64, ExtractError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(meta.len()),
        _ => Err(ExtractError::Empty),
    }
}
