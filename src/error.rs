use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("VALIDATION_ERROR"),
            retry_after_seconds: None,
        }
    }

    pub fn security_rejection(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            code: Some("SECURITY_REJECTION"),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many requests for this endpoint. Slow down and retry later.".to_string(),
            code: Some("RATE_LIMITED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    pub fn upstream_unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "The extraction service is currently unavailable. Retry later.".to_string(),
            code: Some("UPSTREAM_UNAVAILABLE"),
            retry_after_seconds: None,
        }
    }

    pub fn stream_timeout() -> Self {
        Self {
            status: StatusCode::REQUEST_TIMEOUT,
            message: "The media stream did not start before the configured deadline.".to_string(),
            code: Some("STREAM_TIMEOUT"),
            retry_after_seconds: None,
        }
    }

    pub fn stream_aborted() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "The media stream failed before any data could be sent.".to_string(),
            code: Some("STREAM_ABORTED"),
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
