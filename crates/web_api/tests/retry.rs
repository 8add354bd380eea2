use std::time::Duration;

use web_api::retry::*;

#[test]
fn only_server_errors_are_retryable_statuses() {
    assert!(is_retryable_status(500));
    assert!(is_retryable_status(502));
    assert!(is_retryable_status(503));
    assert!(!is_retryable_status(401));
    assert!(!is_retryable_status(429));
    assert!(!is_retryable_status(400));
}

#[test]
fn network_error_text_is_transient() {
    assert!(is_transient_error_text("connection refused"));
    assert!(is_transient_error_text("connection closed before message completed"));
    assert!(is_transient_error_text("operation timed out"));
    assert!(!is_transient_error_text("invalid header value"));
}

#[test]
fn retry_delay_is_exponential_and_capped() {
    let base = Duration::from_millis(BASE_DELAY_MS);
    assert_eq!(retry_delay(base, 0).as_millis(), 1000);
    assert_eq!(retry_delay(base, 1).as_millis(), 2000);
    assert_eq!(retry_delay(base, 2).as_millis(), 4000);
    assert_eq!(retry_delay(base, 3).as_millis(), 8000);
    assert_eq!(retry_delay(base, 10).as_millis(), u128::from(MAX_DELAY_MS));
}
