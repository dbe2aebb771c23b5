//! Database Module
//! SQLite-based storage for the audio file cache and resolved url cache

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Ready,
    Error,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Ready => "ready",
            DownloadStatus::Error => "error",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "ready" => Ok(DownloadStatus::Ready),
            "error" => Ok(DownloadStatus::Error),
            other => Err(format!("unknown download status: {}", other)),
        }
    }
}

impl ToSql for DownloadStatus {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DownloadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFileRecord {
    pub media_id: String,
    pub file_path: String,
    pub file_size: i64,
    pub status: DownloadStatus,
    pub downloaded_at: Option<i64>,
    pub last_played_at: Option<i64>,
    pub error_message: Option<String>,
    pub updated_at: i64,
}

impl AudioFileRecord {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(AudioFileRecord {
            media_id: row.get(0)?,
            file_path: row.get(1)?,
            file_size: row.get(2)?,
            status: row.get(3)?,
            downloaded_at: row.get(4)?,
            last_played_at: row.get(5)?,
            error_message: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

const AUDIO_FILE_COLUMNS: &str = "media_id, file_path, file_size, status, downloaded_at, \
     last_played_at, error_message, updated_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS audio_files (
                media_id TEXT PRIMARY KEY NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                downloaded_at INTEGER,
                last_played_at INTEGER,
                error_message TEXT,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resolved_urls (
                media_id TEXT PRIMARY KEY NOT NULL,
                url TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audio_files_status ON audio_files(status);
            CREATE INDEX IF NOT EXISTS idx_audio_files_last_played ON audio_files(last_played_at);
        "#)?;
        Ok(())
    }

    // Audio file records

    pub fn get_audio_file(&self, media_id: &str) -> Result<Option<AudioFileRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM audio_files WHERE media_id = ?1", AUDIO_FILE_COLUMNS),
                params![media_id],
                AudioFileRecord::from_row,
            )
            .optional()
    }

    /// Atomically move a record into `downloading`, creating it if absent.
    /// Returns false when the record is already downloading, in which case
    /// nothing is written.
    pub fn claim_download(&self, media_id: &str, file_path: &str, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            r#"INSERT INTO audio_files
                   (media_id, file_path, file_size, status, downloaded_at, last_played_at,
                    error_message, updated_at)
               VALUES (?1, ?2, 0, ?3, NULL, NULL, NULL, ?4)
               ON CONFLICT(media_id) DO UPDATE SET
                   file_path = excluded.file_path,
                   file_size = 0,
                   status = excluded.status,
                   error_message = NULL,
                   updated_at = excluded.updated_at
               WHERE audio_files.status != ?3"#,
            params![media_id, file_path, DownloadStatus::Downloading, now],
        )?;
        Ok(changed == 1)
    }

    /// Returns false when no record exists for `media_id`.
    pub fn mark_ready(&self, media_id: &str, file_size: i64, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            r#"UPDATE audio_files
               SET status = ?2, file_size = ?3, downloaded_at = ?4, last_played_at = ?4,
                   error_message = NULL, updated_at = ?4
               WHERE media_id = ?1"#,
            params![media_id, DownloadStatus::Ready, file_size, now],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_error(&self, media_id: &str, message: &str, now: i64) -> Result<()> {
        self.conn.execute(
            r#"UPDATE audio_files
               SET status = ?2, file_size = 0, error_message = ?3, updated_at = ?4
               WHERE media_id = ?1"#,
            params![media_id, DownloadStatus::Error, message, now],
        )?;
        Ok(())
    }

    /// Record a play. Only ready records are touched.
    pub fn touch(&self, media_id: &str, now: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE audio_files SET last_played_at = ?3 WHERE media_id = ?1 AND status = ?2",
            params![media_id, DownloadStatus::Ready, now],
        )?;
        Ok(changed == 1)
    }

    /// Delete the record only while it is still in `status`.
    pub fn delete_audio_file_with_status(&self, media_id: &str, status: DownloadStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM audio_files WHERE media_id = ?1 AND status = ?2",
            params![media_id, status],
        )?;
        Ok(changed == 1)
    }

    /// `(count, total bytes)` over ready records.
    pub fn ready_usage(&self) -> Result<(u64, u64)> {
        self.conn.query_row(
            r#"SELECT COUNT(*), COALESCE(SUM(file_size), 0)
               FROM audio_files WHERE status = ?1"#,
            params![DownloadStatus::Ready],
            |row| {
                let count: i64 = row.get(0)?;
                let bytes: i64 = row.get(1)?;
                Ok((count.max(0) as u64, bytes.max(0) as u64))
            },
        )
    }

    pub fn files_with_status(&self, status: DownloadStatus) -> Result<Vec<AudioFileRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audio_files WHERE status = ?1 ORDER BY media_id",
            AUDIO_FILE_COLUMNS
        ))?;
        let records = stmt.query_map(params![status], AudioFileRecord::from_row)?;
        records.collect()
    }

    /// Ready records last played strictly before `cutoff`.
    pub fn ready_played_before(&self, cutoff: i64) -> Result<Vec<AudioFileRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"SELECT {} FROM audio_files
               WHERE status = ?1 AND COALESCE(last_played_at, downloaded_at, updated_at) < ?2
               ORDER BY last_played_at"#,
            AUDIO_FILE_COLUMNS
        ))?;
        let records = stmt.query_map(params![DownloadStatus::Ready, cutoff], AudioFileRecord::from_row)?;
        records.collect()
    }

    /// Error records whose failure was recorded strictly before `cutoff`.
    pub fn errors_before(&self, cutoff: i64) -> Result<Vec<AudioFileRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM audio_files WHERE status = ?1 AND updated_at < ?2 ORDER BY updated_at",
            AUDIO_FILE_COLUMNS
        ))?;
        let records = stmt.query_map(params![DownloadStatus::Error, cutoff], AudioFileRecord::from_row)?;
        records.collect()
    }

    // Resolved url records

    /// Cached url for `media_id`, only if it expires after `now`.
    pub fn get_resolved_url(&self, media_id: &str, now: i64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT url FROM resolved_urls WHERE media_id = ?1 AND expires_at > ?2",
                params![media_id, now],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn put_resolved_url(&self, media_id: &str, url: &str, expires_at: i64) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO resolved_urls (media_id, url, expires_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(media_id) DO UPDATE SET url = excluded.url, expires_at = excluded.expires_at"#,
            params![media_id, url, expires_at],
        )?;
        Ok(())
    }

    pub fn delete_resolved_url(&self, media_id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM resolved_urls WHERE media_id = ?1",
            params![media_id],
        )?;
        Ok(changed == 1)
    }
}
