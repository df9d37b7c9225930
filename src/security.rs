use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header::CONTENT_LENGTH},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};
use url::Url;

use crate::{AppState, error::ApiError};

pub const MAX_BODY_BYTES: usize = 16 * 1024;
const MAX_USER_AGENT_CHARS: usize = 120;

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    response
}

// Oversized bodies are refused on the declared length alone, before any
// parsing. DefaultBodyLimit remains the backstop for chunked uploads.
pub async fn reject_oversized_bodies(request: Request, next: Next) -> Response {
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());

    if let Some(length) = declared
        && length > MAX_BODY_BYTES
    {
        warn!(
            "rejected {} byte body on {} (limit {MAX_BODY_BYTES})",
            length,
            request.uri().path()
        );
        return ApiError::bad_request("Request body is too large.").into_response();
    }

    next.run(request).await
}

pub async fn log_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = std::time::Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let client_key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| {
            client_ip_for_request(state.config.trust_proxy_headers, request.headers(), info.0)
        })
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(|value| truncate_chars(value, MAX_USER_AGENT_CHARS))
        .unwrap_or_default();

    let response = next.run(request).await;

    info!(
        "{method} {path} -> {} in {}ms client={client_key} ua={user_agent:?}",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );

    response
}

pub fn client_ip_for_request(
    trust_proxy_headers: bool,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> String {
    if trust_proxy_headers {
        forwarded_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

// Untrusted target URLs never reach the log whole; the domain is all an
// operator needs to correlate abuse.
pub fn redact_url(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(ToString::to_string))
        .unwrap_or_else(|| "invalid-url".to_string())
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}
