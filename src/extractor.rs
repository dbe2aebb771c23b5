// Extraction Client Module
// Resolves playable remote urls and downloads+transcodes audio through yt-dlp.
// Callers bound every call with a timeout; the child process is killed when
// the future is dropped.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::config::CacheConfig;
use crate::media_id::MediaId;

/// Keep at most this much of the child's stderr in error messages.
const STDERR_TAIL_BYTES: usize = 600;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("extractor produced an empty result")]
    Empty,
    #[error("failed to run extractor: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ExtractError {
    /// One-line description without process output.
    pub fn summary(&self) -> &'static str {
        match self {
            ExtractError::Timeout(_) => "extraction timed out",
            ExtractError::Failed { .. } => "extraction failed",
            ExtractError::Empty => "extraction produced no audio",
            ExtractError::Spawn(_) => "extractor unavailable",
        }
    }
}

/// The two operations the cache needs from the outside world.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Resolve one directly playable url for `id`.
    async fn resolve_url(&self, id: &MediaId) -> Result<String, ExtractError>;

    /// Download and transcode `id` to an mp3 at `dest`.
    async fn download_to_file(&self, id: &MediaId, dest: &Path) -> Result<(), ExtractError>;
}

/// yt-dlp backed extraction client.
pub struct YtDlp {
    binary: PathBuf,
    cookies_file: Option<PathBuf>,
    format_preference: String,
    watch_url_prefix: String,
}

impl YtDlp {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            binary: config.ytdlp_path.clone(),
            cookies_file: config.cookies_file.clone(),
            format_preference: config.format_preference.clone(),
            watch_url_prefix: config.watch_url_prefix.clone(),
        }
    }

    fn watch_url(&self, id: &MediaId) -> String {
        format!("{}{}", self.watch_url_prefix, id)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-playlist")
            .arg("--no-progress")
            .arg("-f")
            .arg(&self.format_preference);
        if let Some(cookies) = &self.cookies_file {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExtractionClient for YtDlp {
    async fn resolve_url(&self, id: &MediaId) -> Result<String, ExtractError> {
        let mut cmd = self.base_command();
        cmd.arg("--get-url").arg("--").arg(self.watch_url(id));

        log::debug!("resolving stream url for {}", id);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ExtractError::Failed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        first_url_line(&String::from_utf8_lossy(&output.stdout)).ok_or(ExtractError::Empty)
    }

    async fn download_to_file(&self, id: &MediaId, dest: &Path) -> Result<(), ExtractError> {
        // yt-dlp picks the extension itself; the template lands on `<id>.mp3`
        // after the audio postprocessor runs.
        let template = dest.with_extension("%(ext)s");

        let mut cmd = self.base_command();
        cmd.arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--audio-quality")
            .arg("0")
            .arg("-o")
            .arg(&template)
            .arg("--")
            .arg(self.watch_url(id));

        log::info!("downloading {} to {:?}", id, dest);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ExtractError::Failed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(ExtractError::Empty),
        }
    }
}

fn first_url_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(str::to_string)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
