use std::collections::BTreeMap;

use crate::config::{SessionCookies, WebApiConfig};
use crate::error::WebApiError;
use crate::url::normalize_base_url;

pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_COOKIE: &str = "cookie";
pub const HEADER_ORIGIN: &str = "origin";
pub const HEADER_REFERER: &str = "referer";
pub const HEADER_SAME_DOMAIN: &str = "x-same-domain";
pub const HEADER_USER_AGENT: &str = "user-agent";
pub const HEADER_MODEL: &str = "x-goog-ext-525001261-jspb";
pub const HEADER_PUSH_ID: &str = "push-id";

pub const COOKIE_PRIMARY: &str = "__Secure-1PSID";
pub const COOKIE_SECONDARY: &str = "__Secure-1PSIDTS";
pub const COOKIE_TERNARY: &str = "__Secure-1PSIDCC";

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=utf-8";
pub const UPLOAD_PUSH_ID: &str = "feeds/mcudyrk2a4khkz";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Request families with distinct header sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind<'a> {
    /// The app page fetch that yields the anti-forgery token.
    Bootstrap,
    /// Form-encoded RPC posts, optionally pinned to a model.
    Rpc { model_id: Option<&'a str> },
    Upload,
}

/// Render the session cookies as a `Cookie` header value.
///
/// Empty optional cookies are omitted.
pub fn cookie_header(cookies: &SessionCookies) -> Result<String, WebApiError> {
    if cookies.is_empty() {
        return Err(WebApiError::MissingCookies);
    }

    let pairs = [
        (COOKIE_PRIMARY, cookies.primary.trim()),
        (COOKIE_SECONDARY, cookies.secondary.trim()),
        (COOKIE_TERNARY, cookies.ternary.trim()),
    ];
    Ok(pairs
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; "))
}

/// Value of the header that selects a model for a generate call.
pub fn model_header_value(model_id: &str) -> String {
    format!("[1,null,null,null,\"{model_id}\",null,null,0,[4]]")
}

/// Build a deterministic header map for one request.
pub fn build_headers(
    config: &WebApiConfig,
    cookies: &SessionCookies,
    kind: RequestKind<'_>,
) -> Result<BTreeMap<String, String>, WebApiError> {
    let mut headers = BTreeMap::new();
    let origin = normalize_base_url(&config.base_url);

    headers.insert(HEADER_COOKIE.to_owned(), cookie_header(cookies)?);

    let ua = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_USER_AGENT);
    headers.insert(HEADER_USER_AGENT.to_owned(), ua.to_owned());

    match kind {
        RequestKind::Bootstrap => {}
        RequestKind::Rpc { model_id } => {
            headers.insert(HEADER_CONTENT_TYPE.to_owned(), FORM_CONTENT_TYPE.to_owned());
            headers.insert(HEADER_ORIGIN.to_owned(), origin.clone());
            headers.insert(HEADER_REFERER.to_owned(), format!("{origin}/"));
            headers.insert(HEADER_SAME_DOMAIN.to_owned(), "1".to_owned());
            if let Some(model_id) = model_id {
                headers.insert(HEADER_MODEL.to_owned(), model_header_value(model_id));
            }
        }
        RequestKind::Upload => {
            headers.insert(HEADER_PUSH_ID.to_owned(), UPLOAD_PUSH_ID.to_owned());
        }
    }

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    Ok(headers)
}
