pub mod error;
pub mod provider;
pub mod rate_limit;
pub mod routes;
pub mod security;
pub mod stream;
pub mod upstream;
pub mod validate;

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    middleware,
    routing::{get, post},
};
use tokio::{net::TcpListener, signal, time::Duration};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ApiError,
    provider::HttpExtractionProvider,
    rate_limit::{RateLimiter, RateLimits, SystemClock},
    upstream::Orchestrator,
};

const DEFAULT_UPSTREAM_BASE_URL: &str = "http://127.0.0.1:9090";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_STREAM_OPEN_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_FIRST_BYTE_TIMEOUT_SECONDS: u64 = 20;
const DEFAULT_STREAM_DEADLINE_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub trust_proxy_headers: bool,
    pub verify_dns: bool,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub metadata_timeout: Duration,
    pub stream_open_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub stream_deadline: Duration,
    pub limits: RateLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            trust_proxy_headers: false,
            verify_dns: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECONDS),
            stream_open_timeout: Duration::from_secs(DEFAULT_STREAM_OPEN_TIMEOUT_SECONDS),
            first_byte_timeout: Duration::from_secs(DEFAULT_FIRST_BYTE_TIMEOUT_SECONDS),
            stream_deadline: Duration::from_secs(DEFAULT_STREAM_DEADLINE_SECONDS),
            limits: RateLimits::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(base_url) = std::env::var("EXTRACTOR_BASE_URL")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
        {
            config.upstream_base_url = base_url;
        }
        config.trust_proxy_headers = read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false);
        config.verify_dns = read_bool_env("GATEWAY_VERIFY_DNS").unwrap_or(true);

        if let Some(attempts) = read_u32_env("EXTRACTOR_MAX_ATTEMPTS").filter(|value| *value > 0) {
            config.max_attempts = attempts;
        }
        if let Some(millis) = read_u64_env("EXTRACTOR_RETRY_BASE_MS") {
            config.retry_base_delay = Duration::from_millis(millis);
        }
        if let Some(seconds) = read_u64_env("STREAM_DEADLINE_SECONDS").filter(|value| *value > 0) {
            config.stream_deadline = Duration::from_secs(seconds);
        }
        if let Some(budget) = read_u32_env("RATE_LIMIT_METADATA_PER_WINDOW") {
            config.limits.metadata_per_window = budget;
        }
        if let Some(budget) = read_u32_env("RATE_LIMIT_DOWNLOAD_PER_WINDOW") {
            config.limits.download_per_window = budget;
        }

        config
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer()?;

    Ok(Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/media/info", post(routes::media_info))
        .route("/media/audio", post(routes::media_audio))
        .route("/media/video", post(routes::media_video))
        .layer(DefaultBodyLimit::max(security::MAX_BODY_BYTES))
        .layer(middleware::from_fn(security::reject_oversized_bodies))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::log_requests,
        ))
        .layer(middleware::from_fn(security::security_headers))
        .layer(cors)
        .with_state(state))
}

pub async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: the socket IP will be used for rate limiting.");
    }
    if !config.verify_dns {
        warn!("GATEWAY_VERIFY_DNS=false: resolved-IP SSRF checks are disabled.");
    }

    let provider = HttpExtractionProvider::new(&config.upstream_base_url).map_err(|error| {
        ApiError::internal(format!("Could not create the extraction client: {error}"))
    })?;

    let limiter = Arc::new(RateLimiter::new(config.limits, Arc::new(SystemClock)));
    rate_limit::spawn_sweeper(limiter.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(provider),
        config.max_attempts,
        config.retry_base_delay,
    ));

    let state = AppState {
        config: Arc::new(config),
        limiter,
        orchestrator,
        started_at: Instant::now(),
    };

    let app = build_router(state)?;

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("media gateway listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("Could not install the Ctrl+C handler: {error}");
    }
    info!("shutdown signal received");
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://domain.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    info!("CORS allow-list loaded with {} origin(s)", allowed_origins.len());

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static("x-source-title"),
            HeaderName::from_static("x-source-duration"),
        ]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u32_env(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
