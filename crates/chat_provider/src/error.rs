use std::fmt;

use thiserror::Error;

/// Failure taxonomy shared by every layer of the conversation engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("authentication required")]
    AuthRequired,

    #[error("rate limited{}", hint_suffix(.retry_hint))]
    RateLimited { retry_hint: Option<String> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected response format: {0}")]
    Parse(String),

    #[error("a request is already in flight")]
    Busy,

    #[error("session is closed")]
    Closed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{name} is {size} bytes; the limit is {limit} bytes")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("gem '{0}' is predefined and cannot be modified")]
    Immutable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request was cancelled")]
    Cancelled,
}

/// Structured kind of a [`ChatError`], used as a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthRequired,
    RateLimited,
    Transient,
    Protocol,
    ParseError,
    Busy,
    Closed,
    NotFound,
    TooLarge,
    Unsupported,
    Immutable,
    Storage,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Protocol => "protocol",
            Self::ParseError => "parse_error",
            Self::Busy => "busy",
            Self::Closed => "closed",
            Self::NotFound => "not_found",
            Self::TooLarge => "too_large",
            Self::Unsupported => "unsupported",
            Self::Immutable => "immutable",
            Self::Storage => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChatError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired => ErrorKind::AuthRequired,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::Busy => ErrorKind::Busy,
            Self::Closed => ErrorKind::Closed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Immutable(_) => ErrorKind::Immutable,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Single-line text for the UI banner.
    #[must_use]
    pub fn banner(&self) -> String {
        match self {
            Self::AuthRequired => "session expired — refresh cookies".to_owned(),
            Self::RateLimited { retry_hint } => {
                format!("rate limited by the service{}", hint_suffix(retry_hint))
            }
            Self::Parse(_) => "unexpected response format".to_owned(),
            Self::Cancelled => "request cancelled".to_owned(),
            other => first_line(&other.to_string()).to_owned(),
        }
    }

    /// Whether the transport may retry this failure on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint.as_deref().map(str::trim) {
        Some(hint) if !hint.is_empty() => format!(" ({hint})"),
        _ => String::new(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{ChatError, ErrorKind};

    #[test]
    fn banner_uses_fixed_copy_for_auth_and_parse_failures() {
        assert_eq!(
            ChatError::AuthRequired.banner(),
            "session expired — refresh cookies"
        );
        assert_eq!(
            ChatError::Parse("slot 4 missing".to_owned()).banner(),
            "unexpected response format"
        );
    }

    #[test]
    fn rate_limit_banner_carries_retry_hint() {
        let error = ChatError::RateLimited {
            retry_hint: Some("retry after 30s".to_owned()),
        };

        assert_eq!(error.banner(), "rate limited by the service (retry after 30s)");
        assert_eq!(error.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn banner_is_single_line() {
        let error = ChatError::Storage("disk full\nwhile renaming".to_owned());
        assert_eq!(error.banner(), "storage error: disk full");
    }

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(ChatError::Parse(String::new()).kind().to_string(), "parse_error");
        assert_eq!(
            ChatError::TooLarge {
                name: "a.bin".to_owned(),
                size: 2,
                limit: 1,
            }
            .kind()
            .as_str(),
            "too_large"
        );
    }
}
