use std::{net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{
        Request, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER},
    },
};
use bytes::Bytes;
use futures_util::stream;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::time::Duration;
use tower::ServiceExt;
use url::Url;

use media_gateway::{
    AppState, Config, build_router,
    provider::{
        ExtractionProvider, FormatInfo, MediaMetadata, MediaStream, ProviderError, Thumbnail,
    },
    rate_limit::{RateLimiter, SystemClock},
    upstream::Orchestrator,
    validate::Quality,
};

const AUDIO_BYTES: &[u8] = b"mock-audio-bytes-0123456789";
const VIDEO_BYTES: &[u8] = b"mock-video-bytes-9876543210";

struct MockProvider;

fn mock_metadata() -> MediaMetadata {
    let thumbnail = |index: u32| Thumbnail {
        url: format!("https://i.ytimg.com/vi/dQw4w9WgXcQ/{index}.jpg"),
        width: Some(480),
        height: Some(360),
    };
    let format = |id: &str| FormatInfo {
        format_id: id.to_string(),
        container: Some("m4a".to_string()),
        codec: Some("aac".to_string()),
        bitrate_kbps: Some(128.0),
        filesize: Some(3_400_000),
    };

    MediaMetadata {
        id: "dQw4w9WgXcQ".to_string(),
        title: "Rick Astley - Never Gonna Give You Up".to_string(),
        duration_seconds: 213,
        author: "Rick Astley".to_string(),
        thumbnails: (0..8).map(thumbnail).collect(),
        audio_formats: (0..12).map(|index| format(&format!("a{index}"))).collect(),
        video_formats: (0..12).map(|index| format(&format!("v{index}"))).collect(),
    }
}

fn chunked(bytes: &'static [u8]) -> MediaStream {
    let chunks = bytes
        .chunks(8)
        .map(|chunk| Ok(Bytes::from_static(chunk)))
        .collect::<Vec<_>>();
    Box::pin(stream::iter(chunks))
}

#[async_trait]
impl ExtractionProvider for MockProvider {
    async fn fetch_metadata(
        &self,
        _url: &Url,
        _deadline: Duration,
    ) -> Result<MediaMetadata, ProviderError> {
        Ok(mock_metadata())
    }

    async fn open_audio_stream(
        &self,
        _url: &Url,
        _quality: Quality,
        _deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        Ok(chunked(AUDIO_BYTES))
    }

    async fn open_video_stream(
        &self,
        _url: &Url,
        _quality: Quality,
        _deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        Ok(chunked(VIDEO_BYTES))
    }
}

struct FailingProvider {
    status: u16,
}

#[async_trait]
impl ExtractionProvider for FailingProvider {
    async fn fetch_metadata(
        &self,
        _url: &Url,
        _deadline: Duration,
    ) -> Result<MediaMetadata, ProviderError> {
        Err(ProviderError::Status(self.status))
    }

    async fn open_audio_stream(
        &self,
        _url: &Url,
        _quality: Quality,
        _deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        Err(ProviderError::Status(self.status))
    }

    async fn open_video_stream(
        &self,
        _url: &Url,
        _quality: Quality,
        _deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        Err(ProviderError::Status(self.status))
    }
}

fn app_with_provider(provider: Arc<dyn ExtractionProvider>) -> Router {
    let mut config = Config::default();
    config.verify_dns = false;
    config.retry_base_delay = Duration::from_millis(1);

    let limiter = Arc::new(RateLimiter::new(config.limits, Arc::new(SystemClock)));
    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        config.max_attempts,
        config.retry_base_delay,
    ));

    let state = AppState {
        config: Arc::new(config),
        limiter,
        orchestrator,
        started_at: Instant::now(),
    };

    build_router(state).expect("router must build")
}

fn app() -> Router {
    app_with_provider(Arc::new(MockProvider))
}

fn post_json(path: &str, body: Value, client_ip: &str) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request must build");

    let addr: SocketAddr = format!("{client_ip}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn get_request(path: &str, client_ip: &str) -> Request<Body> {
    let mut request = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .expect("request must build");

    let addr: SocketAddr = format!("{client_ip}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("body must be JSON")
}

#[tokio::test]
async fn media_info_returns_capped_metadata() {
    let response = app()
        .oneshot(post_json(
            "/media/info",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-content-type-options")
            .map(|value| value.to_str().unwrap()),
        Some("nosniff")
    );

    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["id"], json!("dQw4w9WgXcQ"));
    assert!(
        body["data"]["title"]
            .as_str()
            .unwrap()
            .contains("Never Gonna Give You Up")
    );
    assert_eq!(body["data"]["durationSeconds"], json!(213));
    assert_eq!(body["data"]["thumbnails"].as_array().unwrap().len(), 5);
    assert_eq!(body["data"]["audioFormats"].as_array().unwrap().len(), 10);
    assert_eq!(body["data"]["videoFormats"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn metadata_endpoint_rejects_private_addresses() {
    let response = app()
        .oneshot(post_json(
            "/media/info",
            json!({"url": "http://169.254.169.254/latest/meta-data"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response
            .headers()
            .get("x-frame-options")
            .map(|value| value.to_str().unwrap()),
        Some("DENY")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!text.contains("169.254"));

    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("SECURITY_REJECTION"));
}

#[tokio::test]
async fn metadata_endpoint_rejects_unlisted_domains() {
    let response = app()
        .oneshot(post_json(
            "/media/info",
            json!({"url": "https://example.com/video"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_bodies_are_a_validation_error() {
    let missing_url = app()
        .oneshot(post_json("/media/info", json!({"link": "nope"}), "1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(missing_url.status(), StatusCode::BAD_REQUEST);

    let bad_url = app()
        .oneshot(post_json("/media/info", json!({"url": "not a url"}), "1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(bad_url.status(), StatusCode::BAD_REQUEST);

    let bad_quality = app()
        .oneshot(post_json(
            "/media/audio",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ", "quality": "ultra"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();
    assert_eq!(bad_quality.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn audio_download_streams_with_download_headers() {
    let response = app()
        .oneshot(post_json(
            "/media/audio",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ", "quality": "high"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| value.to_str().unwrap()),
        Some("audio/mpeg")
    );

    let disposition = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .map(|value| value.to_str().unwrap().to_string())
        .unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("Rick Astley - Never Gonna Give You Up.mp3"));

    assert_eq!(
        response
            .headers()
            .get("x-source-duration")
            .map(|value| value.to_str().unwrap()),
        Some("213")
    );
    assert!(
        response
            .headers()
            .get("x-source-title")
            .map(|value| value.to_str().unwrap())
            .unwrap()
            .contains("Rick Astley")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), AUDIO_BYTES);
}

#[tokio::test]
async fn video_download_uses_video_content_type() {
    let response = app()
        .oneshot(post_json(
            "/media/video",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| value.to_str().unwrap()),
        Some("video/mp4")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), VIDEO_BYTES);
}

#[tokio::test]
async fn download_tier_limits_rapid_clients() {
    let app = app();
    let mut denied = 0;
    let mut saw_retry_after = false;

    for _ in 0..20 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/media/audio",
                json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
                "7.7.7.7",
            ))
            .await
            .unwrap();

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            denied += 1;
            saw_retry_after |= response.headers().contains_key(RETRY_AFTER);
        }
    }

    assert!(denied >= 15, "expected at least 15 denials, got {denied}");
    assert!(saw_retry_after);

    // A different client in the same window is unaffected.
    let other = app
        .clone()
        .oneshot(post_json(
            "/media/audio",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
            "8.8.8.8",
        ))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn upstream_5xx_surfaces_as_unavailable() {
    let response = app_with_provider(Arc::new(FailingProvider { status: 503 }))
        .oneshot(post_json(
            "/media/info",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], json!("UPSTREAM_UNAVAILABLE"));
}

#[tokio::test]
async fn upstream_4xx_surfaces_as_bad_request() {
    let response = app_with_provider(Arc::new(FailingProvider { status: 404 }))
        .oneshot(post_json(
            "/media/info",
            json!({"url": "https://youtube.com/watch?v=dQw4w9WgXcQ"}),
            "1.2.3.4",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_bodies_are_refused_before_parsing() {
    let huge = json!({"url": "x".repeat(64 * 1024)}).to_string();

    let mut request = Request::builder()
        .method("POST")
        .uri("/media/info")
        .header(CONTENT_TYPE, "application/json")
        .header(axum::http::header::CONTENT_LENGTH, huge.len().to_string())
        .body(Body::from(huge))
        .unwrap();
    let addr: SocketAddr = "1.2.3.4:40000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn healthz_reports_uptime() {
    let response = app().oneshot(get_request("/healthz", "1.2.3.4")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("healthy"));
    assert!(body["uptimeSeconds"].is_u64());
    assert!(body["timestamp"].is_string());
}
