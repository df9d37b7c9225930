use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, State, rejection::JsonRejection},
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    AppState,
    error::ApiError,
    provider::MediaMetadata,
    rate_limit::{Decision, Tier},
    security::{client_ip_for_request, redact_url},
    stream,
    upstream::StreamKind,
    validate::{self, DownloadRequest, InfoRequest, MediaFormat, Quality, ValidatedTarget},
};

const MAX_THUMBNAILS: usize = 5;
const MAX_FORMATS: usize = 10;

#[derive(Debug, Serialize)]
pub struct ApiSuccess<T> {
    pub success: bool,
    pub data: T,
}

pub async fn media_info(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<ApiSuccess<MediaMetadata>>, ApiError> {
    let Json(request) = payload
        .map_err(|_| ApiError::bad_request("Request body must be JSON with a url string."))?;

    let client_ip = client_ip_for_request(state.config.trust_proxy_headers, &headers, addr);
    enforce_limit(&state, &client_ip, Tier::Metadata)?;

    let target = checked_target(&state, &request.url).await?;

    let mut metadata = state
        .orchestrator
        .fetch_metadata(&target.sanitized_url, state.config.metadata_timeout)
        .await?;
    metadata.thumbnails.truncate(MAX_THUMBNAILS);
    metadata.audio_formats.truncate(MAX_FORMATS);
    metadata.video_formats.truncate(MAX_FORMATS);

    info!("served metadata for {} to {client_ip}", target.hostname);
    Ok(Json(ApiSuccess {
        success: true,
        data: metadata,
    }))
}

pub async fn media_audio(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    stream_media(state, addr, headers, payload, StreamKind::Audio).await
}

pub async fn media_video(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    stream_media(state, addr, headers, payload, StreamKind::Video).await
}

pub async fn healthz(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let client_ip = client_ip_for_request(state.config.trust_proxy_headers, &headers, addr);
    enforce_limit(&state, &client_ip, Tier::Health)?;

    Ok(Json(json!({
        "status": "healthy",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn stream_media(
    state: AppState,
    addr: SocketAddr,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
    kind: StreamKind,
) -> Result<Response, ApiError> {
    let Json(request) = payload
        .map_err(|_| ApiError::bad_request("Request body must be JSON with a url string."))?;

    let client_ip = client_ip_for_request(state.config.trust_proxy_headers, &headers, addr);
    enforce_limit(&state, &client_ip, Tier::Download)?;

    let format = resolve_format(kind, request.format)?;
    let quality = request.quality.unwrap_or(Quality::High);

    let target = checked_target(&state, &request.url).await?;

    let metadata = state
        .orchestrator
        .fetch_metadata(&target.sanitized_url, state.config.metadata_timeout)
        .await?;

    let upstream = state
        .orchestrator
        .open_stream(
            kind,
            &target.sanitized_url,
            quality,
            state.config.stream_open_timeout,
        )
        .await?;

    let response_headers =
        stream::download_headers(&metadata.title, metadata.duration_seconds, format)?;

    info!(
        "streaming {} from {} for {client_ip}",
        kind.label(),
        target.hostname
    );

    stream::proxy_response(
        upstream,
        response_headers,
        state.config.first_byte_timeout,
        state.config.stream_deadline,
    )
    .await
}

fn enforce_limit(state: &AppState, client_ip: &str, tier: Tier) -> Result<(), ApiError> {
    match state.limiter.check(client_ip, tier) {
        Decision::Allowed => Ok(()),
        Decision::Denied {
            retry_after_seconds,
        } => Err(ApiError::rate_limited(retry_after_seconds)),
    }
}

// Validation is charged after rate limiting; a failed lookup still counts
// against the caller's quota.
async fn checked_target(state: &AppState, raw_url: &str) -> Result<ValidatedTarget, ApiError> {
    let target = validate::validate(raw_url).map_err(|error| {
        warn!("rejected target {}: {error:?}", redact_url(raw_url));
        ApiError::from(error)
    })?;

    if state.config.verify_dns {
        if let Err(error) = validate::ensure_public_resolution(&target.hostname).await {
            warn!("rejected target {} at resolution: {error:?}", target.hostname);
            return Err(ApiError::from(error));
        }
    }

    Ok(target)
}

fn resolve_format(kind: StreamKind, requested: Option<MediaFormat>) -> Result<MediaFormat, ApiError> {
    let format = requested.unwrap_or(match kind {
        StreamKind::Audio => MediaFormat::Mp3,
        StreamKind::Video => MediaFormat::Mp4,
    });

    let matches_kind = match kind {
        StreamKind::Audio => format.is_audio(),
        StreamKind::Video => !format.is_audio(),
    };
    if !matches_kind {
        return Err(ApiError::bad_request(
            "The requested format does not match this endpoint.",
        ));
    }

    Ok(format)
}
