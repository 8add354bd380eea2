use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::config::{SessionCookies, WebApiConfig};
use crate::error::{classify_status, WebApiError};
use crate::frames::{decode_frames, WireFrame};
use crate::headers::{build_headers, RequestKind};
use crate::payload::{batch_form, generate_form, rpc_ids, rpc_query, BatchCall, WireBatch};
use crate::retry::{is_retryable_status, is_transient_error_text, retry_delay, MAX_ATTEMPTS};
use crate::url::{app_url, batch_execute_url, generate_url, is_login_redirect, normalize_base_url};

/// Optional cancellation signal shared across request loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Values scraped from the app page that authorize RPC posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSession {
    /// Anti-forgery token sent as the `at` form field.
    pub access_token: String,
    /// Build label sent as `bl`.
    pub build_label: Option<String>,
    /// Session id sent as `f.sid`.
    pub session_id: Option<String>,
}

/// Which upload endpoint to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    File,
    Image,
}

#[derive(Debug)]
pub struct WebApiClient {
    http: Client,
    config: WebApiConfig,
    cookies: Mutex<SessionCookies>,
    access: Mutex<Option<AccessSession>>,
    request_id: AtomicU64,
}

impl WebApiClient {
    pub fn new(config: WebApiConfig) -> Result<Self, WebApiError> {
        let base = normalize_base_url(&config.base_url);
        ::url::Url::parse(&base).map_err(|error| WebApiError::InvalidBaseUrl(format!("{base}: {error}")))?;
        if config.cookies.is_empty() {
            return Err(WebApiError::MissingCookies);
        }

        let http = Client::builder()
            .timeout(config.attempt_timeout)
            .build()
            .map_err(WebApiError::from)?;
        Ok(Self {
            http,
            cookies: Mutex::new(config.cookies.clone()),
            config,
            access: Mutex::new(None),
            request_id: AtomicU64::new(initial_request_id()),
        })
    }

    pub fn config(&self) -> &WebApiConfig {
        &self.config
    }

    pub fn cookies(&self) -> SessionCookies {
        lock_unpoisoned(&self.cookies).clone()
    }

    /// Replace the session cookies and drop the cached access session.
    pub fn set_cookies(&self, cookies: SessionCookies) -> Result<(), WebApiError> {
        if cookies.is_empty() {
            return Err(WebApiError::MissingCookies);
        }
        *lock_unpoisoned(&self.cookies) = cookies;
        self.reset_access();
        Ok(())
    }

    pub fn access_session(&self) -> Option<AccessSession> {
        lock_unpoisoned(&self.access).clone()
    }

    /// Forget the access session so the next call bootstraps again.
    pub fn reset_access(&self) {
        lock_unpoisoned(&self.access).take();
    }

    fn header_map(&self, kind: RequestKind<'_>) -> Result<HeaderMap, WebApiError> {
        let headers = build_headers(&self.config, &self.cookies(), kind)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| WebApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value)
                    .map_err(|_| WebApiError::InvalidHeader(format!("invalid header value for {key}")))?,
            );
        }
        Ok(out)
    }

    /// Fetch the app page and extract a fresh access session.
    pub async fn bootstrap(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<AccessSession, WebApiError> {
        let request = self
            .http
            .get(app_url(&self.config.base_url))
            .headers(self.header_map(RequestKind::Bootstrap)?)
            .send();
        let response = await_or_cancel(request, cancellation).await??;
        let response = check_response(response, cancellation).await?;
        let page = await_or_cancel(response.text(), cancellation).await??;

        let session = parse_bootstrap_page(&page).ok_or(WebApiError::AuthRequired)?;
        info!(
            has_build_label = session.build_label.is_some(),
            has_session_id = session.session_id.is_some(),
            "web session bootstrapped"
        );
        *lock_unpoisoned(&self.access) = Some(session.clone());
        Ok(session)
    }

    /// Return the cached access session, bootstrapping when absent.
    pub async fn ensure_access(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<AccessSession, WebApiError> {
        if let Some(session) = self.access_session() {
            return Ok(session);
        }
        self.bootstrap(cancellation).await
    }

    /// Dispatch a batch and return its frames.
    ///
    /// Batch-execute frames are returned in request order. Transient
    /// failures are retried; the whole call is bounded by the configured
    /// total deadline.
    pub async fn execute(
        &self,
        batch: &WireBatch,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<WireFrame>, WebApiError> {
        let deadline = self.config.total_deadline;
        let frames = tokio::time::timeout(
            deadline,
            self.with_retry(cancellation, || self.execute_once(batch, cancellation)),
        )
        .await
        .map_err(|_| {
            warn!(deadline_secs = deadline.as_secs(), "request deadline exceeded");
            WebApiError::DeadlineExceeded
        })??;

        match batch {
            WireBatch::Generate(_) => Ok(frames),
            WireBatch::Execute(calls) => order_frames(calls, frames),
        }
    }

    async fn execute_once(
        &self,
        batch: &WireBatch,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<WireFrame>, WebApiError> {
        let access = self.ensure_access(cancellation).await?;
        let request_id = self.next_request_id();
        let mut query = rpc_query(
            access.build_label.as_deref(),
            access.session_id.as_deref(),
            &self.config.language,
            request_id,
        );

        let (url, form, kind) = match batch {
            WireBatch::Generate(call) => (
                generate_url(&self.config.base_url),
                generate_form(call, &access.access_token),
                RequestKind::Rpc {
                    model_id: call.model_id.as_deref(),
                },
            ),
            WireBatch::Execute(calls) => {
                query.insert(0, ("rpcids".to_owned(), rpc_ids(calls)));
                (
                    batch_execute_url(&self.config.base_url),
                    batch_form(calls, &access.access_token),
                    RequestKind::Rpc { model_id: None },
                )
            }
        };

        debug!(request_id, url = %url, "dispatching rpc request");
        let request = self
            .http
            .post(url)
            .headers(self.header_map(kind)?)
            .query(&query)
            .form(&form)
            .send();
        let response = await_or_cancel(request, cancellation).await??;
        let response = check_response(response, cancellation).await?;
        let body = await_or_cancel(response.text(), cancellation).await??;
        decode_frames(&body)
    }

    /// Upload bytes and return the server-issued id.
    pub async fn upload(
        &self,
        target: UploadTarget,
        name: &str,
        mime: &str,
        bytes: Vec<u8>,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<String, WebApiError> {
        let url = match target {
            UploadTarget::File => &self.config.upload_url,
            UploadTarget::Image => &self.config.image_upload_url,
        };

        let bytes = &bytes;
        self.with_retry(cancellation, move || async move {
            let part = Part::bytes(bytes.clone())
                .file_name(name.to_owned())
                .mime_str(mime)?;
            let request = self
                .http
                .post(url.as_str())
                .headers(self.header_map(RequestKind::Upload)?)
                .timeout(self.config.upload_timeout)
                .multipart(Form::new().part("file", part))
                .send();
            let response = await_or_cancel(request, cancellation).await??;
            let response = check_response(response, cancellation).await?;
            let id = await_or_cancel(response.text(), cancellation).await??;
            let id = id.trim();
            if id.is_empty() {
                return Err(WebApiError::MalformedFrames("upload returned an empty id".to_owned()));
            }
            debug!(upload_target = ?target, name, "upload accepted");
            Ok(id.to_owned())
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancellation: Option<&CancellationSignal>,
        mut operation: F,
    ) -> Result<T, WebApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WebApiError>>,
    {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if is_cancelled(cancellation) {
                return Err(WebApiError::Cancelled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if should_retry(&error) => {
                    if let WebApiError::Status(status, _) = &error {
                        last_status = Some(*status);
                    }
                    last_error = Some(error.to_string());
                    if attempt + 1 < MAX_ATTEMPTS {
                        let delay = retry_delay(self.config.retry_base_delay, attempt);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "transient failure, retrying");
                        await_or_cancel(tokio::time::sleep(delay), cancellation).await?;
                    }
                }
                Err(error) => {
                    if matches!(error, WebApiError::AuthRequired) {
                        self.reset_access();
                    }
                    return Err(error);
                }
            }
        }

        Err(WebApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(100_000, Ordering::Relaxed)
    }
}

/// Extract the access session from the app page.
///
/// Returns `None` when the anti-forgery token is absent, which is what
/// an unauthenticated page looks like.
pub fn parse_bootstrap_page(page: &str) -> Option<AccessSession> {
    let access_token = capture(token_regex(), page)?;
    Some(AccessSession {
        access_token,
        build_label: capture(build_label_regex(), page),
        session_id: capture(session_id_regex(), page),
    })
}

fn capture(regex: &Regex, page: &str) -> Option<String> {
    regex
        .captures(page)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().to_owned())
        .filter(|value| !value.is_empty())
}

fn token_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r#""SNlM0e":"(.*?)""#).expect("token regex must compile"))
}

fn build_label_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r#""cfb2h":"(.*?)""#).expect("build label regex must compile"))
}

fn session_id_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r#""FdrFJe":"(.*?)""#).expect("session id regex must compile"))
}

/// Map redirects to sign-in and non-success statuses to errors.
async fn check_response(
    response: Response,
    cancellation: Option<&CancellationSignal>,
) -> Result<Response, WebApiError> {
    if is_login_redirect(response.url()) {
        return Err(WebApiError::AuthRequired);
    }

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = await_or_cancel(response.text(), cancellation)
        .await?
        .unwrap_or_default();
    Err(classify_status(status, &body, retry_after.as_deref()))
}

fn should_retry(error: &WebApiError) -> bool {
    match error {
        WebApiError::Status(status, _) => is_retryable_status(status.as_u16()),
        WebApiError::Request(error) => {
            error.is_connect()
                || error.is_timeout()
                || error.is_request()
                || is_transient_error_text(&error_chain_text(error))
        }
        _ => false,
    }
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Match frames to calls by `(rpc_id, identifier)`, preserving call order.
fn order_frames(calls: &[BatchCall], frames: Vec<WireFrame>) -> Result<Vec<WireFrame>, WebApiError> {
    let mut remaining: Vec<Option<WireFrame>> = frames.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(calls.len());

    for call in calls {
        let position = remaining.iter().position(|slot| {
            slot.as_ref().is_some_and(|frame| {
                frame.rpc_id.as_deref() == Some(call.rpc_id.as_str())
                    && frame
                        .identifier
                        .as_deref()
                        .map_or(true, |identifier| identifier == call.identifier)
            })
        });
        let frame = position
            .and_then(|index| remaining[index].take())
            .ok_or_else(|| {
                WebApiError::MalformedFrames(format!(
                    "no response frame for {} ({})",
                    call.rpc_id, call.identifier
                ))
            })?;
        ordered.push(frame);
    }

    Ok(ordered)
}

fn initial_request_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    10_000 + seconds % 90_000
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, WebApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(WebApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(WebApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
