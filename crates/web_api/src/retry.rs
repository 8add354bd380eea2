use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Total attempts for one request, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;
/// Base delay before the first retry.
pub const BASE_DELAY_MS: u64 = 1000;
/// Upper bound for any single backoff delay.
pub const MAX_DELAY_MS: u64 = 8000;

fn transient_error_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)timed?.?out|connection.?(refused|reset|closed)|broken.?pipe|service.?unavailable|upstream.?connect|dns",
        )
        .expect("transient error regex must compile")
    })
}

/// Status retry policy: only server-side failures are retried.
pub fn is_retryable_status(status: u16) -> bool {
    (500..=599).contains(&status)
}

/// Transport error text that indicates a transient network condition.
pub fn is_transient_error_text(error_text: &str) -> bool {
    transient_error_regex().is_match(error_text)
}

/// Exponential backoff for the retry following `attempt` (zero based),
/// capped at [`MAX_DELAY_MS`].
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(30);
    let delay = base.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(Duration::from_millis(MAX_DELAY_MS))
}
