use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::BASE_DELAY_MS;
use crate::url::{DEFAULT_BASE_URL, DEFAULT_UPLOAD_URL};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TOTAL_DEADLINE: Duration = Duration::from_secs(180);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Browser session cookies that authenticate every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCookies {
    /// `__Secure-1PSID`; required.
    pub primary: String,
    /// `__Secure-1PSIDTS`.
    pub secondary: String,
    /// `__Secure-1PSIDCC`.
    pub ternary: String,
}

impl SessionCookies {
    pub fn new(
        primary: impl Into<String>,
        secondary: impl Into<String>,
        ternary: impl Into<String>,
    ) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
            ternary: ternary.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.trim().is_empty()
    }
}

impl std::fmt::Debug for SessionCookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |value: &str| if value.is_empty() { "<empty>" } else { "<redacted>" };
        f.debug_struct("SessionCookies")
            .field("primary", &redact(&self.primary))
            .field("secondary", &redact(&self.secondary))
            .field("ternary", &redact(&self.ternary))
            .finish()
    }
}

/// Transport configuration for web API requests.
#[derive(Debug, Clone)]
pub struct WebApiConfig {
    pub cookies: SessionCookies,
    /// Origin of the chat web application.
    pub base_url: String,
    /// Endpoint for generic file uploads.
    pub upload_url: String,
    /// Endpoint for image uploads.
    pub image_upload_url: String,
    /// Interface language sent as `hl`.
    pub language: String,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// Timeout of a single request attempt.
    pub attempt_timeout: Duration,
    /// Deadline for one `execute` call, retries included.
    pub total_deadline: Duration,
    /// Timeout of one upload.
    pub upload_timeout: Duration,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for WebApiConfig {
    fn default() -> Self {
        Self {
            cookies: SessionCookies::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            image_upload_url: DEFAULT_UPLOAD_URL.to_string(),
            language: "en".to_string(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            total_deadline: DEFAULT_TOTAL_DEADLINE,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            retry_base_delay: Duration::from_millis(BASE_DELAY_MS),
        }
    }
}

impl WebApiConfig {
    pub fn new(cookies: SessionCookies) -> Self {
        Self {
            cookies,
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = upload_url.into();
        self
    }

    pub fn with_image_upload_url(mut self, image_upload_url: impl Into<String>) -> Self {
        self.image_upload_url = image_upload_url.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_total_deadline(mut self, deadline: Duration) -> Self {
        self.total_deadline = deadline;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
