use std::fmt;

use reqwest::StatusCode;
use serde_json::Error as JsonError;

/// Service-level error code that signals an exhausted usage quota.
pub const USAGE_LIMIT_CODE: i64 = 1037;

#[derive(Debug)]
pub enum WebApiError {
    MissingCookies,
    InvalidBaseUrl(String),
    InvalidHeader(String),
    Request(reqwest::Error),
    /// Non-success status that is neither auth nor rate limiting.
    Status(StatusCode, String),
    /// Cookies were rejected or the service redirected to sign-in.
    AuthRequired,
    RateLimited {
        retry_after: Option<String>,
    },
    MalformedFrames(String),
    Serde(JsonError),
    DeadlineExceeded,
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    Cancelled,
}

impl fmt::Display for WebApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCookies => write!(f, "session cookie __Secure-1PSID is required"),
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::AuthRequired => write!(f, "authentication required"),
            Self::RateLimited { retry_after } => match retry_after {
                Some(hint) => write!(f, "rate limited (retry after {hint})"),
                None => write!(f, "rate limited"),
            },
            Self::MalformedFrames(message) => write!(f, "malformed response frames: {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::DeadlineExceeded => write!(f, "request deadline exceeded"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error:?})"
                )
            }
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for WebApiError {}

impl From<reqwest::Error> for WebApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for WebApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

impl WebApiError {
    /// Transient failures are worth another attempt with the same inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(error) => error.is_connect() || error.is_timeout() || error.is_request(),
            Self::Status(status, _) => status.is_server_error(),
            Self::DeadlineExceeded | Self::RetryExhausted { .. } => true,
            _ => false,
        }
    }
}

/// Map a non-success status to the error the caller should see.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<&str>) -> WebApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WebApiError::AuthRequired,
        StatusCode::TOO_MANY_REQUESTS => WebApiError::RateLimited {
            retry_after: retry_after
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
        },
        _ => WebApiError::Status(status, parse_error_message(status, body)),
    }
}

/// Extract a short human-readable message from an error body.
///
/// Error pages are HTML; the `<title>` is used when present, otherwise the
/// first non-empty line, otherwise the canonical reason.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Some(title) = html_title(body) {
        return title;
    }

    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('<'))
        .map(|line| truncate(line, 200))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

fn html_title(body: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();
    let start = lower.find("<title>")? + "<title>".len();
    let end = lower[start..].find("</title>")? + start;
    let title = body.get(start..end)?.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_owned())
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_owned(),
    }
}
