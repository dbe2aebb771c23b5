//! Config Module
//! Explicit engine configuration, built once at startup and passed down

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one `<id>.mp3` per cached item.
    pub cache_root: PathBuf,
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Aggregate size of ready files the quota is measured against.
    pub max_cache_bytes: u64,
    pub ready_retention_secs: u64,
    pub error_retention_secs: u64,
    pub url_ttl_secs: u64,
    /// New downloads are refused at or above this usage percentage.
    pub admission_threshold_percent: u32,
    pub download_timeout_secs: u64,
    pub resolve_timeout_secs: u64,
    /// Bound on connecting to an upstream and receiving its response headers.
    pub upstream_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    pub ytdlp_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub format_preference: String,
    pub watch_url_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Audiocast");

        Self {
            cache_root: data_dir.join("audio_cache"),
            database_path: data_dir.join("audiocast.db"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            max_cache_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            ready_retention_secs: 30 * DAY_SECS,
            error_retention_secs: 7 * DAY_SECS,
            url_ttl_secs: 5 * 60 * 60,
            admission_threshold_percent: 90,
            download_timeout_secs: 5 * 60,
            resolve_timeout_secs: 30,
            upstream_timeout_secs: 15,
            eviction_interval_secs: 60 * 60,
            ytdlp_path: PathBuf::from("yt-dlp"),
            cookies_file: None,
            format_preference: "bestaudio/140/best".to_string(),
            watch_url_prefix: "https://www.youtube.com/watch?v=".to_string(),
        }
    }
}

impl CacheConfig {
    /// Defaults overlaid with `AUDIOCAST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("AUDIOCAST_CACHE_ROOT") {
            config.cache_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("AUDIOCAST_DATABASE") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AUDIOCAST_BIND") {
            config.bind_addr = parse_value("AUDIOCAST_BIND", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_MAX_CACHE_BYTES") {
            config.max_cache_bytes = parse_value("AUDIOCAST_MAX_CACHE_BYTES", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_READY_RETENTION_SECS") {
            config.ready_retention_secs = parse_value("AUDIOCAST_READY_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_ERROR_RETENTION_SECS") {
            config.error_retention_secs = parse_value("AUDIOCAST_ERROR_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_URL_TTL_SECS") {
            config.url_ttl_secs = parse_value("AUDIOCAST_URL_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_ADMISSION_THRESHOLD_PERCENT") {
            config.admission_threshold_percent =
                parse_value("AUDIOCAST_ADMISSION_THRESHOLD_PERCENT", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_DOWNLOAD_TIMEOUT_SECS") {
            config.download_timeout_secs = parse_value("AUDIOCAST_DOWNLOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_RESOLVE_TIMEOUT_SECS") {
            config.resolve_timeout_secs = parse_value("AUDIOCAST_RESOLVE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_UPSTREAM_TIMEOUT_SECS") {
            config.upstream_timeout_secs = parse_value("AUDIOCAST_UPSTREAM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_EVICTION_INTERVAL_SECS") {
            config.eviction_interval_secs = parse_value("AUDIOCAST_EVICTION_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("AUDIOCAST_YTDLP") {
            config.ytdlp_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AUDIOCAST_COOKIES") {
            if !v.trim().is_empty() {
                config.cookies_file = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("AUDIOCAST_FORMAT") {
            if !v.trim().is_empty() {
                config.format_preference = v.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_bytes == 0 {
            return Err(invalid("AUDIOCAST_MAX_CACHE_BYTES", self.max_cache_bytes));
        }
        if !(1..=100).contains(&self.admission_threshold_percent) {
            return Err(invalid(
                "AUDIOCAST_ADMISSION_THRESHOLD_PERCENT",
                self.admission_threshold_percent,
            ));
        }
        if self.eviction_interval_secs == 0 {
            return Err(invalid("AUDIOCAST_EVICTION_INTERVAL_SECS", self.eviction_interval_secs));
        }
        Ok(())
    }

    pub fn ready_retention(&self) -> Duration {
        Duration::from_secs(self.ready_retention_secs)
    }

    pub fn error_retention(&self) -> Duration {
        Duration::from_secs(self.error_retention_secs)
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
