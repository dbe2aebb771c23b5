// Integration tests for the HTTP surface: local range serving, proxy
// fallback on expired urls, and the status/trigger/admin endpoints.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;

use audiocast_lib::database::unix_now;
use audiocast_lib::media_id::MediaId;
use audiocast_lib::server::{ApiServer, AppState};

use support::{pattern, test_config, test_state, DownloadBehavior, FakeExtractor};

const UPSTREAM_SIZE: usize = 4096;

#[derive(Clone, Default)]
struct UpstreamHits {
    expired: Arc<AtomicUsize>,
    gone: Arc<AtomicUsize>,
    audio: Arc<AtomicUsize>,
    missing: Arc<AtomicUsize>,
}

async fn expired_handler(State(hits): State<UpstreamHits>) -> Response {
    hits.expired.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FORBIDDEN, "signature expired").into_response()
}

async fn gone_handler(State(hits): State<UpstreamHits>) -> Response {
    hits.gone.fetch_add(1, Ordering::SeqCst);
    (StatusCode::GONE, "url no longer valid").into_response()
}

async fn missing_handler(State(hits): State<UpstreamHits>) -> Response {
    hits.missing.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "no such object").into_response()
}

/// Serves `pattern(UPSTREAM_SIZE)` with single-range support.
async fn audio_handler(State(hits): State<UpstreamHits>, headers: HeaderMap) -> Response {
    hits.audio.fetch_add(1, Ordering::SeqCst);
    let content = pattern(UPSTREAM_SIZE);
    let total = content.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .map(|(s, e)| {
            let start: usize = s.parse().unwrap_or(0);
            let end: usize = e.parse().unwrap_or(total - 1).min(total - 1);
            (start, end)
        });

    match range {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "audio/webm".to_string()),
                (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            content[start..=end].to_vec(),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "audio/webm".to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            content,
        )
            .into_response(),
    }
}

/// Start a fake media host; returns its base url and hit counters.
async fn start_upstream() -> (String, UpstreamHits) {
    let hits = UpstreamHits::default();
    let app = Router::new()
        .route("/expired", get(expired_handler))
        .route("/gone", get(gone_handler))
        .route("/audio", get(audio_handler))
        .route("/missing", get(missing_handler))
        .with_state(hits.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://127.0.0.1:{}", port), hits)
}

async fn start_server(state: AppState) -> ApiServer {
    ApiServer::start("127.0.0.1:0".parse().unwrap(), state).await.unwrap()
}

#[tokio::test]
async fn local_file_serves_exact_byte_range() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeExtractor::new(DownloadBehavior::Write(1000)));
    let (state, db) = test_state(test_config(dir.path()), fake.clone());
    let media = MediaId::parse("aaaaaaaaaaa").unwrap();
    state.downloads.download(&media).await.unwrap();
    db.lock().touch(media.as_str(), 1).unwrap();

    let server = start_server(state).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/stream/aaaaaaaaaaa"))
        .header("Range", "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 100-199/1000");
    assert_eq!(resp.headers()["content-length"], "100");
    assert_eq!(resp.headers()["content-type"], "audio/mpeg");
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &pattern(1000)[100..200]);

    let resp = client.get(server.url("/stream/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "1000");
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.bytes().await.unwrap().len(), 1000);

    let resp = client
        .get(server.url("/stream/aaaaaaaaaaa"))
        .header("Range", "bytes=5000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(resp.headers()["content-range"], "bytes */1000");

    // Serving touched the record in the background.
    let mut touched = false;
    for _ in 0..100 {
        let played = db.lock().get_audio_file("aaaaaaaaaaa").unwrap().unwrap().last_played_at;
        if played.unwrap_or(0) > 1 {
            touched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(touched);
    assert_eq!(fake.resolve_count(), 0);

    server.shutdown();
}

#[tokio::test]
async fn invalid_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeExtractor::new(DownloadBehavior::Write(10)));
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let server = start_server(state).await;
    let client = reqwest::Client::new();

    for path in ["/stream/short", "/status/waytoolongid1", "/stream/bad.id.here"] {
        let resp = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(resp.status(), 400, "{}", path);
    }
    let resp = client.post(server.url("/download/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(fake.resolve_count(), 0);
    assert_eq!(fake.download_count(), 0);

    server.shutdown();
}

#[tokio::test]
async fn rejected_cached_url_triggers_exactly_one_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, hits) = start_upstream().await;
    let fake = Arc::new(
        FakeExtractor::new(DownloadBehavior::Write(10)).with_urls(&[format!("{}/audio", upstream)]),
    );
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let media = MediaId::parse("bbbbbbbbbbb").unwrap();
    state
        .urls
        .put(&media, &format!("{}/expired", upstream), Duration::from_secs(3600))
        .unwrap();
    let urls = state.urls.clone();

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/bbbbbbbbbbb"))
        .header("Range", "bytes=10-19")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], format!("bytes 10-19/{}", UPSTREAM_SIZE));
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.headers()["content-type"], "audio/webm");
    assert_eq!(&resp.bytes().await.unwrap()[..], &pattern(UPSTREAM_SIZE)[10..20]);

    assert_eq!(fake.resolve_count(), 1);
    assert_eq!(hits.expired.load(Ordering::SeqCst), 1);
    assert_eq!(hits.audio.load(Ordering::SeqCst), 1);
    assert_eq!(urls.get(&media).unwrap(), Some(format!("{}/audio", upstream)));

    server.shutdown();
}

#[tokio::test]
async fn gone_cached_url_triggers_exactly_one_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, hits) = start_upstream().await;
    let fake = Arc::new(
        FakeExtractor::new(DownloadBehavior::Write(10)).with_urls(&[format!("{}/audio", upstream)]),
    );
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let media = MediaId::parse("bbbbbbbbbb2").unwrap();
    state
        .urls
        .put(&media, &format!("{}/gone", upstream), Duration::from_secs(3600))
        .unwrap();
    let urls = state.urls.clone();

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/bbbbbbbbbb2"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().len(), UPSTREAM_SIZE);
    assert_eq!(fake.resolve_count(), 1);
    assert_eq!(hits.gone.load(Ordering::SeqCst), 1);
    assert_eq!(hits.audio.load(Ordering::SeqCst), 1);
    assert_eq!(urls.get(&media).unwrap(), Some(format!("{}/audio", upstream)));

    server.shutdown();
}

#[tokio::test]
async fn second_rejection_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, hits) = start_upstream().await;
    let fake = Arc::new(
        FakeExtractor::new(DownloadBehavior::Write(10)).with_urls(&[format!("{}/expired", upstream)]),
    );
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let media = MediaId::parse("ccccccccccc").unwrap();
    state
        .urls
        .put(&media, &format!("{}/expired", upstream), Duration::from_secs(3600))
        .unwrap();

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/ccccccccccc"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    assert_eq!(fake.resolve_count(), 1);
    assert_eq!(hits.expired.load(Ordering::SeqCst), 2);

    server.shutdown();
}

#[tokio::test]
async fn expired_url_record_is_never_used() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, hits) = start_upstream().await;
    let fake = Arc::new(
        FakeExtractor::new(DownloadBehavior::Write(10)).with_urls(&[format!("{}/audio", upstream)]),
    );
    let (state, db) = test_state(test_config(dir.path()), fake.clone());
    db.lock()
        .put_resolved_url("ddddddddddd", &format!("{}/missing", upstream), unix_now() - 1)
        .unwrap();

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/ddddddddddd"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().len(), UPSTREAM_SIZE);
    assert_eq!(hits.missing.load(Ordering::SeqCst), 0);
    assert_eq!(fake.resolve_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn other_upstream_errors_are_surfaced_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, hits) = start_upstream().await;
    let fake = Arc::new(
        FakeExtractor::new(DownloadBehavior::Write(10)).with_urls(&[format!("{}/audio", upstream)]),
    );
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let media = MediaId::parse("eeeeeeeeeee").unwrap();
    state
        .urls
        .put(&media, &format!("{}/missing", upstream), Duration::from_secs(3600))
        .unwrap();

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/eeeeeeeeeee"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert_eq!(fake.resolve_count(), 0);
    assert_eq!(hits.missing.load(Ordering::SeqCst), 1);
    assert_eq!(hits.audio.load(Ordering::SeqCst), 0);

    server.shutdown();
}

#[tokio::test]
async fn failed_resolution_returns_plain_error() {
    let dir = tempfile::tempdir().unwrap();
    // No urls configured: the fake reports an empty result.
    let fake = Arc::new(FakeExtractor::new(DownloadBehavior::Write(10)));
    let (state, _) = test_state(test_config(dir.path()), fake.clone());

    let server = start_server(state).await;
    let resp = reqwest::Client::new()
        .get(server.url("/stream/fffffffffff"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    assert_eq!(resp.text().await.unwrap(), "no playable audio found");
    assert_eq!(fake.resolve_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn status_and_trigger_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeExtractor::new(DownloadBehavior::Write(1000)));
    let (state, _) = test_state(test_config(dir.path()), fake.clone());
    let server = start_server(state).await;
    let client = reqwest::Client::new();

    let status: serde_json::Value = client
        .get(server.url("/status/aaaaaaaaaaa"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status, serde_json::json!({ "status": "none" }));

    let resp = client.post(server.url("/download/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["status"] == "downloading" || body["status"] == "ready");

    let mut ready = false;
    for _ in 0..200 {
        let status: serde_json::Value = client
            .get(server.url("/status/aaaaaaaaaaa"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["status"] == "ready" {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready);

    let usage: serde_json::Value = client
        .get(server.url("/cache/usage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["fileCount"], 1);
    assert_eq!(usage["totalBytes"], 1000);

    // Already ready: no second extraction.
    let resp = client.post(server.url("/download/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    assert_eq!(fake.download_count(), 1);

    let resp = client.delete(server.url("/cache/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    assert!(!dir.path().join("aaaaaaaaaaa.mp3").exists());
    let resp = client.delete(server.url("/cache/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let report: serde_json::Value = client
        .post(server.url("/cache/evict"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["evicted"], 0);

    server.shutdown();
}

#[tokio::test]
async fn trigger_is_refused_when_quota_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeExtractor::new(DownloadBehavior::Write(900)));
    let mut config = test_config(dir.path());
    config.max_cache_bytes = 1000;
    let (state, _) = test_state(config, fake.clone());

    state
        .downloads
        .download(&MediaId::parse("aaaaaaaaaaa").unwrap())
        .await
        .unwrap();
    assert!(!state.quota.can_admit().unwrap());

    let server = start_server(state).await;
    let client = reqwest::Client::new();

    let resp = client.post(server.url("/download/bbbbbbbbbbb")).send().await.unwrap();
    assert_eq!(resp.status(), 507);
    assert_eq!(fake.download_count(), 1);

    // Reads of ready files are unaffected.
    let resp = client.get(server.url("/stream/aaaaaaaaaaa")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    server.shutdown();
}
