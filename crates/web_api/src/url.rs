/// Default origin of the chat web application.
pub const DEFAULT_BASE_URL: &str = "https://gemini.google.com";
/// Default upload endpoint for files and images.
pub const DEFAULT_UPLOAD_URL: &str = "https://content-push.googleapis.com/upload";
/// Host that unauthenticated requests get redirected to.
pub const LOGIN_HOST: &str = "accounts.google.com";

const APP_PATH: &str = "/app";
const GENERATE_PATH: &str =
    "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
const BATCH_EXECUTE_PATH: &str = "/_/BardChatUi/data/batchexecute";

/// Normalize a base URL to the bare application origin.
///
/// Normalization rules:
/// 1) empty input falls back to [`DEFAULT_BASE_URL`]
/// 2) trailing slashes are removed
/// 3) a trailing `/app` segment is removed
pub fn normalize_base_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    trimmed
        .strip_suffix(APP_PATH)
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_string()
}

/// Page fetched once per session to obtain the anti-forgery token.
pub fn app_url(base: &str) -> String {
    format!("{}{APP_PATH}", normalize_base_url(base))
}

pub fn generate_url(base: &str) -> String {
    format!("{}{GENERATE_PATH}", normalize_base_url(base))
}

pub fn batch_execute_url(base: &str) -> String {
    format!("{}{BATCH_EXECUTE_PATH}", normalize_base_url(base))
}

/// True when a response landed on the sign-in host.
pub fn is_login_redirect(url: &::url::Url) -> bool {
    url.host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(LOGIN_HOST))
}
