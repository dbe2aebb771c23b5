//! Disk Quota Module
//! Usage accounting, download admission and time-based eviction

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CacheConfig;
use crate::database::{unix_now, AudioFileRecord, Database, DownloadStatus};
use crate::error::{CacheError, Result};
use crate::media_id::MediaId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsageSnapshot {
    pub file_count: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub evicted: usize,
    pub errors_purged: usize,
    pub bytes_freed: u64,
}

#[derive(Clone)]
pub struct DiskQuota {
    db: Arc<Mutex<Database>>,
    config: Arc<CacheConfig>,
}

impl DiskQuota {
    pub fn new(db: Arc<Mutex<Database>>, config: Arc<CacheConfig>) -> Self {
        Self { db, config }
    }

    pub fn usage(&self) -> Result<DiskUsageSnapshot> {
        let (file_count, total_bytes) = self.db.lock().ready_usage()?;
        let max_bytes = self.config.max_cache_bytes;
        let usage_percent = if max_bytes == 0 {
            100.0
        } else {
            total_bytes as f64 / max_bytes as f64 * 100.0
        };
        Ok(DiskUsageSnapshot {
            file_count,
            total_bytes,
            max_bytes,
            usage_percent,
        })
    }

    /// Whether a new download may start. Reads of ready files are never gated.
    pub fn can_admit(&self) -> Result<bool> {
        let usage = self.usage()?;
        Ok(below_threshold(
            usage.total_bytes,
            usage.max_bytes,
            self.config.admission_threshold_percent,
        ))
    }

    pub fn check_admission(&self) -> Result<()> {
        let usage = self.usage()?;
        let threshold_percent = self.config.admission_threshold_percent;
        if below_threshold(usage.total_bytes, usage.max_bytes, threshold_percent) {
            Ok(())
        } else {
            Err(CacheError::QuotaExceeded {
                usage_percent: usage.usage_percent,
                threshold_percent,
            })
        }
    }

    pub fn evict_stale(&self) -> Result<EvictionReport> {
        self.evict_stale_at(unix_now())
    }

    /// Drop ready files not played within the retention horizon and error
    /// records older than the error horizon, as seen from `now`.
    pub fn evict_stale_at(&self, now: i64) -> Result<EvictionReport> {
        let ready_cutoff = horizon(now, self.config.ready_retention_secs);
        let error_cutoff = horizon(now, self.config.error_retention_secs);

        let (stale, failed) = {
            let db = self.db.lock();
            (db.ready_played_before(ready_cutoff)?, db.errors_before(error_cutoff)?)
        };

        let mut report = EvictionReport::default();

        for record in stale {
            if self.evict_record(&record, DownloadStatus::Ready)? {
                report.evicted += 1;
                report.bytes_freed += record.file_size.max(0) as u64;
            }
        }

        for record in failed {
            if self.evict_record(&record, DownloadStatus::Error)? {
                report.errors_purged += 1;
            }
        }

        if report.evicted > 0 || report.errors_purged > 0 {
            log::info!(
                "eviction removed {} stale files ({} bytes) and {} error records",
                report.evicted,
                report.bytes_freed,
                report.errors_purged
            );
        }

        Ok(report)
    }

    /// Delete a scanned record and its file, unless the record left `status`
    /// since the scan (a retry may have claimed it and be writing the file).
    fn evict_record(&self, record: &AudioFileRecord, status: DownloadStatus) -> Result<bool> {
        let db = self.db.lock();
        if !db.delete_audio_file_with_status(&record.media_id, status)? {
            log::debug!("skipping eviction of {}: record changed since scan", record.media_id);
            return Ok(false);
        }
        remove_file_quietly(Path::new(&record.file_path));
        Ok(true)
    }

    /// Mark `id` as just played. Never fails the caller.
    pub fn touch(&self, id: &MediaId) {
        if let Err(e) = self.db.lock().touch(id.as_str(), unix_now()) {
            log::warn!("failed to update last played time for {}: {}", id, e);
        }
    }

    /// Remove the cached file and record for `id`. Refused while a download
    /// is running.
    pub fn remove(&self, id: &MediaId) -> Result<bool> {
        let record = match self.db.lock().get_audio_file(id.as_str())? {
            Some(record) => record,
            None => return Ok(false),
        };

        match record.status {
            DownloadStatus::Downloading => Err(CacheError::InProgress(id.to_string())),
            DownloadStatus::Pending | DownloadStatus::Ready | DownloadStatus::Error => {
                let db = self.db.lock();
                if !db.delete_audio_file_with_status(id.as_str(), record.status)? {
                    return Err(CacheError::InProgress(id.to_string()));
                }
                remove_file_quietly(Path::new(&record.file_path));
                Ok(true)
            }
        }
    }
}

/// Run `evict_stale` every `interval` for the life of the runtime.
pub fn spawn_eviction_task(quota: DiskQuota, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let quota = quota.clone();
            match tokio::task::spawn_blocking(move || quota.evict_stale()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::error!("scheduled eviction failed: {}", e),
                Err(e) => log::error!("scheduled eviction panicked: {}", e),
            }
        }
    })
}

/// `now - retention_secs`, saturating for retentions beyond the i64 range.
fn horizon(now: i64, retention_secs: u64) -> i64 {
    now.saturating_sub(i64::try_from(retention_secs).unwrap_or(i64::MAX))
}

fn below_threshold(total_bytes: u64, max_bytes: u64, threshold_percent: u32) -> bool {
    (total_bytes as u128) * 100 < (threshold_percent as u128) * (max_bytes as u128)
}

/// Delete `path`, treating an already-missing file as success.
pub(crate) fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {:?}: {}", path, e),
    }
}
