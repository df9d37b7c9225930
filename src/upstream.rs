use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::ApiError,
    provider::{ExtractionProvider, MediaMetadata, MediaStream, ProviderError},
    validate::Quality,
};

const DEGRADE_FAILURE_THRESHOLD: u32 = 3;
const DEGRADE_COOLDOWN_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

// Advisory only: staleness is acceptable, the orchestrator still owns the
// authoritative retry budget.
#[derive(Debug, Default)]
pub struct HealthSignal {
    inner: Mutex<HealthInner>,
}

impl HealthSignal {
    pub fn record_success(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("health signal poisoned");
        inner.consecutive_failures = 0;
        inner.last_success = Some(now);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("health signal poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure = Some(now);
    }

    // Degrade-fast: once the provider has failed repeatedly and recently,
    // skip the expensive download path instead of burning a retry budget.
    // A cooled-down failure streak lets one probe through again.
    pub fn looks_dead(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock().expect("health signal poisoned");
        if inner.consecutive_failures < DEGRADE_FAILURE_THRESHOLD {
            return false;
        }
        inner
            .last_failure
            .is_some_and(|at| now - at < ChronoDuration::seconds(DEGRADE_COOLDOWN_SECONDS))
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ExtractionProvider>,
    health: HealthSignal,
    max_attempts: u32,
    base_delay: Duration,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ExtractionProvider>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            provider,
            health: HealthSignal::default(),
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub async fn fetch_metadata(
        &self,
        url: &Url,
        deadline: Duration,
    ) -> Result<MediaMetadata, ApiError> {
        self.call_with_retries("metadata fetch", || {
            self.provider.fetch_metadata(url, deadline)
        })
        .await
    }

    pub async fn open_stream(
        &self,
        kind: StreamKind,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ApiError> {
        if self.health.looks_dead(Utc::now()) {
            warn!(
                "skipping {} stream open: extraction provider looks unavailable",
                kind.label()
            );
            return Err(ApiError::upstream_unavailable());
        }

        self.call_with_retries(kind.label(), || match kind {
            StreamKind::Audio => self.provider.open_audio_stream(url, quality, deadline),
            StreamKind::Video => self.provider.open_video_stream(url, quality, deadline),
        })
        .await
    }

    async fn call_with_retries<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => {
                    self.health.record_success(Utc::now());
                    if attempt > 1 {
                        debug!("{operation} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_retryable() => {
                    warn!("{operation} rejected by extraction provider: {error}");
                    return Err(if error.is_client_error() {
                        ApiError::bad_request(
                            "The extraction provider could not process this media URL.",
                        )
                    } else {
                        ApiError::upstream_unavailable()
                    });
                }
                Err(error) => {
                    self.health.record_failure(Utc::now());
                    warn!(
                        "{operation} attempt {attempt}/{} failed: {error}",
                        self.max_attempts
                    );
                    if attempt >= self.max_attempts {
                        return Err(ApiError::upstream_unavailable());
                    }
                    tokio::time::sleep(self.base_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
