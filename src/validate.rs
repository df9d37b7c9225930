//! URL validation: host allow-listing, private-address rejection, query
//! sanitization and resource-id extraction. Everything here is pure except
//! the optional resolved-IP check.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::ApiError;

const MAX_URL_CHARS: usize = 2048;

const ALLOWED_DOMAINS: [&str; 10] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
    "vimeo.com",
    "www.vimeo.com",
    "player.vimeo.com",
    "dailymotion.com",
    "www.dailymotion.com",
];

const ALLOWED_QUERY_PARAMS: [&str; 4] = ["v", "t", "list", "index"];

#[derive(Debug, PartialEq, Eq)]
pub enum ValidateError {
    InvalidFormat(&'static str),
    DisallowedDomain,
    PrivateAddress,
}

impl From<ValidateError> for ApiError {
    fn from(error: ValidateError) -> Self {
        match error {
            ValidateError::InvalidFormat(message) => ApiError::bad_request(message),
            ValidateError::DisallowedDomain => {
                ApiError::security_rejection("This media host is not supported by the gateway.")
            }
            ValidateError::PrivateAddress => {
                ApiError::security_rejection("The requested URL is not allowed.")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTarget {
    pub sanitized_url: Url,
    pub hostname: String,
    pub video_id: String,
}

#[derive(Debug, Deserialize)]
pub struct InfoRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Option<Quality>,
    pub format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp3,
    M4a,
    Mp4,
    Webm,
}

impl MediaFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::M4a => "audio/mp4",
            MediaFormat::Mp4 => "video/mp4",
            MediaFormat::Webm => "video/webm",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::M4a => "m4a",
            MediaFormat::Mp4 => "mp4",
            MediaFormat::Webm => "webm",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, MediaFormat::Mp3 | MediaFormat::M4a)
    }
}

pub fn validate(raw_url: &str) -> Result<ValidatedTarget, ValidateError> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return Err(ValidateError::InvalidFormat("URL must not be empty."));
    }
    if trimmed.len() > MAX_URL_CHARS {
        return Err(ValidateError::InvalidFormat("URL is too long."));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|_| ValidateError::InvalidFormat("URL could not be parsed."))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidateError::InvalidFormat(
            "Only http and https URLs are accepted.",
        ));
    }

    let host = parsed
        .host()
        .ok_or(ValidateError::InvalidFormat("URL has no hostname."))?;

    // Private-range rejection happens before the allow-list so a literal
    // internal address is reported as a security rejection, not an
    // unsupported domain.
    if is_private_host(&host) {
        return Err(ValidateError::PrivateAddress);
    }

    let hostname = match host {
        Host::Domain(domain) => domain.to_ascii_lowercase(),
        Host::Ipv4(_) | Host::Ipv6(_) => return Err(ValidateError::PrivateAddress),
    };

    if !ALLOWED_DOMAINS.iter().any(|domain| hostname == *domain) {
        return Err(ValidateError::DisallowedDomain);
    }

    let sanitized_url = sanitize(&parsed);
    let video_id = extract_video_id(&sanitized_url).ok_or(ValidateError::InvalidFormat(
        "URL does not reference a recognizable media resource.",
    ))?;

    Ok(ValidatedTarget {
        sanitized_url,
        hostname,
        video_id,
    })
}

pub fn sanitize(url: &Url) -> Url {
    let mut sanitized = url.clone();

    let kept = url
        .query_pairs()
        .filter(|(key, _)| ALLOWED_QUERY_PARAMS.iter().any(|allowed| key == allowed))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();

    sanitized.set_fragment(None);
    if kept.is_empty() {
        sanitized.set_query(None);
    } else {
        sanitized.query_pairs_mut().clear().extend_pairs(kept);
    }

    sanitized
}

pub async fn ensure_public_resolution(hostname: &str) -> Result<(), ValidateError> {
    let mut resolved = tokio::net::lookup_host((hostname, 443))
        .await
        .map_err(|_| ValidateError::InvalidFormat("URL hostname could not be resolved."))?
        .peekable();

    if resolved.peek().is_none() {
        return Err(ValidateError::InvalidFormat(
            "URL hostname could not be resolved.",
        ));
    }

    for addr in resolved {
        if is_private_ip(addr.ip()) {
            return Err(ValidateError::PrivateAddress);
        }
    }

    Ok(())
}

fn is_private_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let lowered = domain.to_ascii_lowercase();
            lowered == "localhost"
                || lowered.ends_with(".localhost")
                || lowered.ends_with(".local")
                || lowered.ends_with(".internal")
        }
        Host::Ipv4(addr) => is_private_ipv4(*addr),
        Host::Ipv6(addr) => is_private_ipv6(*addr),
    }
}

fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_documentation()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // Benchmarking 198.18.0.0/15
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
}

fn is_private_ipv6(addr: Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_private_ipv4(mapped);
    }

    let segments = addr.segments();
    addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // Unique-local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // Link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
}

fn extract_video_id(url: &Url) -> Option<String> {
    if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "v")
        && is_valid_media_id(&value)
    {
        return Some(value.into_owned());
    }

    let host = url.host_str().unwrap_or_default();
    let mut segments = url
        .path_segments()
        .map(|iter| iter.filter(|segment| !segment.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    if host == "youtu.be" {
        return segments
            .first()
            .filter(|segment| is_valid_media_id(segment))
            .map(ToString::to_string);
    }

    if let Some(position) = segments
        .iter()
        .position(|segment| matches!(*segment, "shorts" | "embed" | "video"))
    {
        return segments
            .get(position + 1)
            .filter(|segment| is_valid_media_id(segment))
            .map(ToString::to_string);
    }

    segments
        .pop()
        .filter(|segment| is_valid_media_id(segment))
        .map(ToString::to_string)
}

fn is_valid_media_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
}
