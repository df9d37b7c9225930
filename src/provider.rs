use std::{fmt, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Duration, timeout};
use url::Url;

use crate::validate::Quality;

pub type MediaStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

#[derive(Debug)]
pub enum ProviderError {
    Timeout,
    Connect(String),
    Status(u16),
    Protocol(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Connect(_) => true,
            ProviderError::Status(code) => (500..=599).contains(code),
            ProviderError::Protocol(_) => false,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, ProviderError::Status(code) if (400..=499).contains(code))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout => write!(formatter, "call timed out"),
            ProviderError::Connect(detail) => write!(formatter, "connection failed: {detail}"),
            ProviderError::Status(code) => write!(formatter, "unexpected status {code}"),
            ProviderError::Protocol(detail) => write!(formatter, "protocol error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub author: String,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    pub audio_formats: Vec<FormatInfo>,
    #[serde(default)]
    pub video_formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatInfo {
    pub format_id: String,
    pub container: Option<String>,
    pub codec: Option<String>,
    pub bitrate_kbps: Option<f32>,
    pub filesize: Option<u64>,
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn fetch_metadata(
        &self,
        url: &Url,
        deadline: Duration,
    ) -> Result<MediaMetadata, ProviderError>;

    async fn open_audio_stream(
        &self,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ProviderError>;

    async fn open_video_stream(
        &self,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ProviderError>;
}

pub struct HttpExtractionProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExtractionProvider {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/extract/{operation}", self.base_url)
    }

    // The deadline covers request setup and response headers. Stream bodies
    // are intentionally not bounded here; the stream proxy owns that
    // deadline.
    async fn open_stream(
        &self,
        operation: &str,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        let request = self
            .client
            .post(self.endpoint(operation))
            .json(&json!({ "url": url.as_str(), "quality": quality.as_str() }));

        let response = timeout(deadline, request.send())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let stream = response.bytes_stream().map_err(classify);
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ExtractionProvider for HttpExtractionProvider {
    async fn fetch_metadata(
        &self,
        url: &Url,
        deadline: Duration,
    ) -> Result<MediaMetadata, ProviderError> {
        let call = async {
            let response = self
                .client
                .post(self.endpoint("metadata"))
                .json(&json!({ "url": url.as_str() }))
                .send()
                .await
                .map_err(classify)?;

            let status = response.status();
            if !status.is_success() {
                return Err(ProviderError::Status(status.as_u16()));
            }

            response.json::<MediaMetadata>().await.map_err(classify)
        };

        timeout(deadline, call)
            .await
            .map_err(|_| ProviderError::Timeout)?
    }

    async fn open_audio_stream(
        &self,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        self.open_stream("audio", url, quality, deadline).await
    }

    async fn open_video_stream(
        &self,
        url: &Url,
        quality: Quality,
        deadline: Duration,
    ) -> Result<MediaStream, ProviderError> {
        self.open_stream("video", url, quality, deadline).await
    }
}

fn classify(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout
    } else if error.is_connect() {
        ProviderError::Connect(error.to_string())
    } else if let Some(status) = error.status() {
        ProviderError::Status(status.as_u16())
    } else {
        ProviderError::Protocol(error.to_string())
    }
}
