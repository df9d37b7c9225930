//! Deadline-bounded proxying of an upstream byte stream into the client
//! response body. Chunks move through a bounded channel; the session ends in
//! exactly one terminal state no matter which side fails first.

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant, sleep_until, timeout},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    provider::MediaStream,
    validate::MediaFormat,
};

const CHANNEL_CAPACITY: usize = 8;
const MAX_FILENAME_CHARS: usize = 80;
const MAX_HEADER_TITLE_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Streaming,
    Completed,
    Aborted,
    TimedOut,
}

#[derive(Debug)]
struct StreamSession {
    id: Uuid,
    bytes_transferred: u64,
    state: SessionState,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes_transferred: 0,
            state: SessionState::Opening,
        }
    }

    // One-way: the first terminal transition wins, later signals are no-ops.
    fn finish(&mut self, terminal: SessionState) -> bool {
        if matches!(
            self.state,
            SessionState::Completed | SessionState::Aborted | SessionState::TimedOut
        ) {
            return false;
        }
        self.state = terminal;
        true
    }

    fn outcome(&self) -> StreamOutcome {
        match self.state {
            SessionState::Completed => StreamOutcome::Completed,
            SessionState::TimedOut => StreamOutcome::TimedOut,
            _ => StreamOutcome::Aborted,
        }
    }
}

pub async fn proxy_response(
    mut upstream: MediaStream,
    headers: HeaderMap,
    first_byte_timeout: Duration,
    deadline: Duration,
) -> Result<Response, ApiError> {
    let mut session = StreamSession::new();

    let first = match timeout(first_byte_timeout, upstream.next()).await {
        Err(_) => {
            session.finish(SessionState::TimedOut);
            warn!("stream session {} timed out before the first byte", session.id);
            return Err(ApiError::stream_timeout());
        }
        Ok(Some(Err(error))) => {
            session.finish(SessionState::Aborted);
            warn!(
                "stream session {} failed before the first byte: {error}",
                session.id
            );
            return Err(ApiError::stream_aborted());
        }
        Ok(Some(Ok(chunk))) => chunk,
        Ok(None) => Bytes::new(),
    };

    let (body, _pump) = attach(session, upstream, first, deadline);
    Ok((StatusCode::OK, headers, body).into_response())
}

fn attach(
    mut session: StreamSession,
    mut upstream: MediaStream,
    first: Bytes,
    deadline: Duration,
) -> (Body, JoinHandle<StreamOutcome>) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);

    let pump = tokio::spawn(async move {
        let hard_deadline = Instant::now() + deadline;
        session.state = SessionState::Streaming;
        let mut pending = Some(first);

        loop {
            if let Some(chunk) = pending.take() {
                let chunk_len = chunk.len() as u64;
                // The send races the deadline too: a stalled client must not
                // park the pump past the wall clock.
                tokio::select! {
                    _ = sleep_until(hard_deadline) => {
                        session.finish(SessionState::TimedOut);
                        break;
                    }
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            // Receiver dropped: the client went away.
                            session.finish(SessionState::Aborted);
                            break;
                        }
                        session.bytes_transferred += chunk_len;
                    }
                }
            }

            tokio::select! {
                _ = sleep_until(hard_deadline) => {
                    session.finish(SessionState::TimedOut);
                    break;
                }
                next = upstream.next() => match next {
                    Some(Ok(chunk)) => pending = Some(chunk),
                    Some(Err(error)) => {
                        warn!(
                            "stream session {} upstream error after {} bytes: {error}",
                            session.id, session.bytes_transferred
                        );
                        let _ = tx.try_send(Err(std::io::Error::other("upstream stream failed")));
                        session.finish(SessionState::Aborted);
                        break;
                    }
                    None => {
                        session.finish(SessionState::Completed);
                        break;
                    }
                }
            }
        }

        // Dropping the upstream stream is the single close/cancel of the
        // provider connection.
        drop(upstream);

        let outcome = session.outcome();
        info!(
            "stream session {} finished: {:?} after {} bytes",
            session.id, outcome, session.bytes_transferred
        );
        outcome
    });

    (Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)), pump)
}

pub fn download_headers(
    title: &str,
    duration_seconds: u64,
    format: MediaFormat,
) -> Result<HeaderMap, ApiError> {
    let filename = format!("{}.{}", sanitize_filename(title), format.extension());

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let header_title = truncate_chars(&sanitize_ascii(title), MAX_HEADER_TITLE_CHARS);
    headers.insert(
        HeaderName::from_static("x-source-title"),
        HeaderValue::from_str(&header_title)
            .map_err(|_| ApiError::internal("Could not build the source title header."))?,
    );
    headers.insert(
        HeaderName::from_static("x-source-duration"),
        HeaderValue::from_str(&duration_seconds.to_string())
            .map_err(|_| ApiError::internal("Could not build the source duration header."))?,
    );

    Ok(headers)
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

// Untrusted titles become filenames: path separators and control characters
// are stripped and the result is length-bounded.
pub fn sanitize_filename(title: &str) -> String {
    let mut sanitized = String::with_capacity(title.len());
    for character in title.chars() {
        if character.is_control()
            || matches!(
                character,
                '/' | '\\' | '"' | ':' | '*' | '?' | '<' | '>' | '|'
            )
        {
            sanitized.push('_');
        } else {
            sanitized.push(character);
        }
    }

    let bounded = truncate_chars(sanitized.trim(), MAX_FILENAME_CHARS);
    let compact = bounded.trim();
    if compact.is_empty() {
        "download".to_string()
    } else {
        compact.to_string()
    }
}

fn sanitize_ascii(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }
    sanitized.trim().to_string()
}

fn truncate_chars(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}
