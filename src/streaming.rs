// Streaming Responder Module
// Serves audio for a media id: straight from the disk cache when a ready
// file exists, otherwise by proxying a resolved remote url with range
// passthrough. A 403/410 from a cached url triggers exactly one fresh
// resolution and retry.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::config::CacheConfig;
use crate::database::AudioFileRecord;
use crate::downloader::DownloadOrchestrator;
use crate::extractor::{ExtractError, ExtractionClient};
use crate::media_id::MediaId;
use crate::quota::DiskQuota;
use crate::url_cache::UrlCache;

const AUDIO_MPEG: &str = "audio/mpeg";

/// Upstream headers copied onto proxied responses.
const MIRRORED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
];

/// One byte range from a `Range: bytes=...` header.
#[derive(Debug, PartialEq, Eq)]
enum RequestedRange {
    /// `first-last`, both inclusive.
    Closed(u64, u64),
    /// `first-`: from `first` to the end of the file.
    From(u64),
    /// `-n`: the final `n` bytes.
    Last(u64),
}

/// Only the single-range forms are understood. Anything else, including a
/// range list (its `,` makes the second bound unparseable), yields `None` and
/// the request is answered with the full body.
fn parse_range_header(value: &str) -> Option<RequestedRange> {
    let (first, last) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    match (bound(first)?, bound(last)?) {
        (Some(first), Some(last)) => Some(RequestedRange::Closed(first, last)),
        (Some(first), None) => Some(RequestedRange::From(first)),
        (None, Some(n)) if n > 0 => Some(RequestedRange::Last(n)),
        _ => None,
    }
}

/// An empty bound is `Some(None)`; a malformed one is `None`.
fn bound(raw: &str) -> Option<Option<u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        Some(None)
    } else {
        raw.parse().ok().map(Some)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ByteSpan {
    Full,
    /// Inclusive on both ends.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Map a requested range onto a file of `total` bytes. Ends past the file are
/// clamped; starts past it are unsatisfiable.
fn resolve_span(range: Option<RequestedRange>, total: u64) -> ByteSpan {
    let (start, end) = match range {
        None => return ByteSpan::Full,
        Some(RequestedRange::Closed(first, last)) => (first, last.min(total.saturating_sub(1))),
        Some(RequestedRange::From(first)) => (first, total.saturating_sub(1)),
        Some(RequestedRange::Last(n)) => (total.saturating_sub(n), total.saturating_sub(1)),
    };
    if total == 0 || start >= total || end < start {
        ByteSpan::Unsatisfiable
    } else {
        ByteSpan::Partial { start, end }
    }
}

enum ProxyOutcome {
    /// Upstream answered with something the client should see as-is.
    Served(Response),
    /// Upstream rejected the url (403/410).
    Expired(StatusCode),
    /// Connection, handshake or timeout failure.
    Failed(String),
}

/// HTTP client for upstream media hosts.
pub fn http_client(config: &CacheConfig) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .connect_timeout(config.upstream_timeout())
        .build()
}

#[derive(Clone)]
pub struct StreamingResponder {
    downloads: DownloadOrchestrator,
    quota: DiskQuota,
    urls: UrlCache,
    extractor: Arc<dyn ExtractionClient>,
    http: Client,
    config: Arc<CacheConfig>,
}

impl StreamingResponder {
    pub fn new(
        downloads: DownloadOrchestrator,
        quota: DiskQuota,
        urls: UrlCache,
        extractor: Arc<dyn ExtractionClient>,
        http: Client,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            downloads,
            quota,
            urls,
            extractor,
            http,
            config,
        }
    }

    pub async fn respond(&self, id: &MediaId, range: Option<&str>) -> Response {
        match self.downloads.ready_file(id).await {
            Ok(Some(record)) => {
                if let Some(response) = self.serve_local(id, &record, range).await {
                    return response;
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("cache lookup failed for {}: {}", id, e);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }

        match self.urls.get(id) {
            Ok(Some(url)) => match self.proxy(&url, range).await {
                ProxyOutcome::Served(response) => return response,
                ProxyOutcome::Expired(status) => {
                    log::info!("cached url for {} rejected with {}, resolving again", id, status);
                    if let Err(e) = self.urls.invalidate(id) {
                        log::warn!("failed to invalidate url for {}: {}", id, e);
                    }
                }
                ProxyOutcome::Failed(reason) => {
                    log::warn!("proxy to cached url for {} failed: {}", id, reason);
                    return plain(StatusCode::BAD_GATEWAY, "upstream request failed");
                }
            },
            Ok(None) => {}
            Err(e) => {
                log::error!("url cache lookup failed for {}: {}", id, e);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }

        let url = match self.resolve(id).await {
            Ok(url) => url,
            Err(ExtractError::Empty) => {
                log::warn!("no playable url found for {}", id);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "no playable audio found");
            }
            Err(e) => {
                log::warn!("url resolution failed for {}: {}", id, e);
                return plain(StatusCode::BAD_GATEWAY, "could not resolve audio url");
            }
        };
        if let Err(e) = self.urls.put(id, &url, self.config.url_ttl()) {
            log::warn!("failed to cache resolved url for {}: {}", id, e);
        }

        match self.proxy(&url, range).await {
            ProxyOutcome::Served(response) => response,
            ProxyOutcome::Expired(status) => {
                log::warn!("freshly resolved url for {} rejected with {}", id, status);
                if let Err(e) = self.urls.invalidate(id) {
                    log::warn!("failed to invalidate url for {}: {}", id, e);
                }
                plain(StatusCode::BAD_GATEWAY, "upstream rejected audio url")
            }
            ProxyOutcome::Failed(reason) => {
                log::warn!("proxy for {} failed: {}", id, reason);
                plain(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }

    async fn resolve(&self, id: &MediaId) -> Result<String, ExtractError> {
        let timeout = self.config.resolve_timeout();
        match tokio::time::timeout(timeout, self.extractor.resolve_url(id)).await {
            Ok(Ok(url)) if !url.trim().is_empty() => Ok(url),
            Ok(Ok(_)) => Err(ExtractError::Empty),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExtractError::Timeout(timeout)),
        }
    }

    /// Serve a ready file. `None` when the file vanished before it could be
    /// opened, so the caller can fall back to the remote path.
    async fn serve_local(
        &self,
        id: &MediaId,
        record: &AudioFileRecord,
        range: Option<&str>,
    ) -> Option<Response> {
        let mut file = match File::open(&record.file_path).await {
            Ok(file) => file,
            Err(e) => {
                log::warn!("cached file for {} could not be opened: {}", id, e);
                return None;
            }
        };
        let total = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::warn!("cached file for {} could not be inspected: {}", id, e);
                return None;
            }
        };

        let span = resolve_span(range.and_then(parse_range_header), total);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(AUDIO_MPEG));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

        let response = match span {
            ByteSpan::Unsatisfiable => {
                insert_header(&mut headers, header::CONTENT_RANGE, format!("bytes */{}", total));
                return Some((StatusCode::RANGE_NOT_SATISFIABLE, headers, "range not satisfiable").into_response());
            }
            ByteSpan::Full => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
                (StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response()
            }
            ByteSpan::Partial { start, end } => {
                if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                    log::warn!("seek failed in cached file for {}: {}", id, e);
                    return None;
                }
                let len = end - start + 1;
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                insert_header(
                    &mut headers,
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                );
                let body = Body::from_stream(ReaderStream::new(file.take(len)));
                (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
            }
        };

        let quota = self.quota.clone();
        let id = id.clone();
        tokio::spawn(async move {
            quota.touch(&id);
        });

        Some(response)
    }

    async fn proxy(&self, url: &str, range: Option<&str>) -> ProxyOutcome {
        let mut request = self.http.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }

        let upstream = match tokio::time::timeout(self.config.upstream_timeout(), request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return ProxyOutcome::Failed(e.to_string()),
            Err(_) => return ProxyOutcome::Failed("upstream handshake timed out".to_string()),
        };

        let status = upstream.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::GONE {
            return ProxyOutcome::Expired(status);
        }
        if !status.is_success() {
            log::warn!("upstream answered {} for proxied request", status);
            return ProxyOutcome::Served(plain(status, &format!("upstream returned HTTP {}", status.as_u16())));
        }

        let mut headers = HeaderMap::new();
        for name in MIRRORED_HEADERS {
            if let Some(value) = upstream.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

        let body = Body::from_stream(
            upstream
                .bytes_stream()
                .inspect_err(|e| log::debug!("upstream stream ended early: {}", e)),
        );
        ProxyOutcome::Served((status, headers, body).into_response())
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(name, value);
    }
}

/// Short plain-text response for user-visible failures.
pub fn plain(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response()
}
