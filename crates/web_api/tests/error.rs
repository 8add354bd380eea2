use reqwest::StatusCode;

use web_api::error::{classify_status, parse_error_message};
use web_api::WebApiError;

#[test]
fn auth_statuses_map_to_auth_required() {
    assert!(matches!(
        classify_status(StatusCode::UNAUTHORIZED, "", None),
        WebApiError::AuthRequired
    ));
    assert!(matches!(
        classify_status(StatusCode::FORBIDDEN, "", None),
        WebApiError::AuthRequired
    ));
}

#[test]
fn too_many_requests_keeps_retry_after_hint() {
    let error = classify_status(StatusCode::TOO_MANY_REQUESTS, "", Some(" 30 "));
    assert!(matches!(
        error,
        WebApiError::RateLimited { retry_after: Some(ref hint) } if hint == "30"
    ));
    assert!(!error.is_transient());
}

#[test]
fn server_errors_are_transient() {
    let error = classify_status(StatusCode::BAD_GATEWAY, "", None);
    assert!(error.is_transient());
    assert!(!classify_status(StatusCode::NOT_FOUND, "", None).is_transient());
}

#[test]
fn parse_error_message_prefers_html_title() {
    let body = "<html><head><TITLE> Error 400 (Bad Request)!! </TITLE></head></html>";
    let message = parse_error_message(StatusCode::BAD_REQUEST, body);
    assert_eq!(message, "Error 400 (Bad Request)!!");
}

#[test]
fn parse_error_message_falls_back_to_raw_body() {
    let message = parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, "raw failure text");
    assert_eq!(message, "raw failure text");
}

#[test]
fn parse_error_message_falls_back_to_reason_for_empty_body() {
    let message = parse_error_message(StatusCode::SERVICE_UNAVAILABLE, "");
    assert_eq!(message, "Service Unavailable");
}
