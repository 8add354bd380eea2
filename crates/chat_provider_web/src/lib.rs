//! Web-service implementation of the shared `chat_provider` contract.
//!
//! This adapter maps contract batches onto `web_api` wire calls, bridges the
//! async transport onto the caller's thread, and owns the session
//! lifecycle: idle auto-close, re-initialization and cookie refresh.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chat_provider::{
    BackendProfile, CancelSignal, ChatBackend, ChatError, Frame, Gem, GemDraft,
    GemMutation, Model, RpcBatch, RpcCall, Upload,
};
use tracing::{debug, info, warn};
use web_api::gems::{
    create_call, delete_call, list_calls, parse_created_gem_id, parse_gem_list, update_call,
};
use web_api::{
    BatchCall, FileRef, GenerateCall, SessionCookies, UploadTarget, WebApiClient, WebApiConfig,
    WebApiError, WireBatch, WireFrame, WireGem,
};

/// Stable backend identifier used for explicit startup selection.
pub const WEB_BACKEND_ID: &str = "web";

/// Service-side id that selects a model through the model header.
#[must_use]
pub fn model_wire_id(model: Model) -> Option<&'static str> {
    match model {
        Model::Unspecified => None,
        Model::Flash25 => Some("71c2d248d3b102ff"),
        Model::Pro25 => Some("4af6c7f5da75d65d"),
        Model::Pro30 => Some("9d8ca3786ebdfbea"),
    }
}

/// Supplies fresh session cookies, e.g. from a logged-in browser profile.
pub trait CookieSource: Send + Sync {
    fn fresh_cookies(&self) -> Result<SessionCookies, String>;
}

/// Runtime configuration for the web backend.
#[derive(Debug, Clone)]
pub struct WebBackendConfig {
    pub cookies: SessionCookies,
    pub base_url: Option<String>,
    pub attempt_timeout: Option<Duration>,
    pub total_deadline: Option<Duration>,
    pub upload_timeout: Option<Duration>,
    /// Drop the session after `close_delay` without calls.
    pub auto_close: bool,
    pub close_delay: Duration,
    /// Bootstrap again on the next call after an auto-close.
    pub auto_re_init: bool,
}

impl WebBackendConfig {
    #[must_use]
    pub fn new(cookies: SessionCookies) -> Self {
        Self {
            cookies,
            base_url: None,
            attempt_timeout: None,
            total_deadline: None,
            upload_timeout: None,
            auto_close: false,
            close_delay: Duration::from_secs(300),
            auto_re_init: true,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, attempt: Duration, total: Duration, upload: Duration) -> Self {
        self.attempt_timeout = Some(attempt);
        self.total_deadline = Some(total);
        self.upload_timeout = Some(upload);
        self
    }

    #[must_use]
    pub fn with_auto_close(mut self, close_delay: Duration, auto_re_init: bool) -> Self {
        self.auto_close = true;
        self.close_delay = close_delay;
        self.auto_re_init = auto_re_init;
        self
    }

    fn to_web_api_config(&self) -> WebApiConfig {
        let mut config = WebApiConfig::new(self.cookies.clone());

        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(timeout) = self.attempt_timeout {
            config = config.with_attempt_timeout(timeout);
        }
        if let Some(deadline) = self.total_deadline {
            config = config.with_total_deadline(deadline);
        }
        if let Some(timeout) = self.upload_timeout {
            config = config.with_upload_timeout(timeout);
        }

        config
    }
}

/// Blocking seam over the async wire client.
trait WireClient: Send + Sync {
    fn execute(
        &self,
        batch: &WireBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<WireFrame>, WebApiError>;

    fn upload(&self, target: UploadTarget, upload: &Upload) -> Result<String, WebApiError>;

    fn set_cookies(&self, cookies: SessionCookies) -> Result<(), WebApiError>;

    fn reset_access(&self);

    fn endpoint(&self) -> String;
}

struct DefaultWireClient {
    client: WebApiClient,
    runtime: tokio::runtime::Runtime,
}

impl WireClient for DefaultWireClient {
    fn execute(
        &self,
        batch: &WireBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<WireFrame>, WebApiError> {
        self.runtime.block_on(self.client.execute(batch, cancel))
    }

    fn upload(&self, target: UploadTarget, upload: &Upload) -> Result<String, WebApiError> {
        self.runtime.block_on(self.client.upload(
            target,
            &upload.name,
            &upload.mime,
            upload.bytes.clone(),
            None,
        ))
    }

    fn set_cookies(&self, cookies: SessionCookies) -> Result<(), WebApiError> {
        self.client.set_cookies(cookies)
    }

    fn reset_access(&self) {
        self.client.reset_access();
    }

    fn endpoint(&self) -> String {
        web_api::normalize_base_url(&self.client.config().base_url)
    }
}

#[derive(Debug)]
struct Lifecycle {
    last_activity: Instant,
    closed: bool,
}

/// `ChatBackend` adapter backed by `web_api` transport primitives.
pub struct WebBackend {
    client: Arc<dyn WireClient>,
    cookie_source: Option<Arc<dyn CookieSource>>,
    lifecycle: Mutex<Lifecycle>,
    auto_close: bool,
    close_delay: Duration,
    auto_re_init: bool,
}

impl WebBackend {
    /// Creates a backend using the real web transport.
    pub fn new(
        config: WebBackendConfig,
        cookie_source: Option<Arc<dyn CookieSource>>,
    ) -> Result<Self, ChatError> {
        let client = WebApiClient::new(config.to_web_api_config()).map_err(map_error)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("web-transport")
            .enable_all()
            .build()
            .map_err(|error| {
                ChatError::Protocol(format!("failed to initialize tokio runtime: {error}"))
            })?;

        Ok(Self::with_client(
            Arc::new(DefaultWireClient { client, runtime }),
            cookie_source,
            &config,
        ))
    }

    fn with_client(
        client: Arc<dyn WireClient>,
        cookie_source: Option<Arc<dyn CookieSource>>,
        config: &WebBackendConfig,
    ) -> Self {
        Self {
            client,
            cookie_source,
            lifecycle: Mutex::new(Lifecycle {
                last_activity: Instant::now(),
                closed: false,
            }),
            auto_close: config.auto_close,
            close_delay: config.close_delay,
            auto_re_init: config.auto_re_init,
        }
    }

    /// Drops the session state. The next call re-initializes only when
    /// auto re-init is enabled.
    pub fn close(&self) {
        let mut lifecycle = lock_unpoisoned(&self.lifecycle);
        self.client.reset_access();
        lifecycle.closed = true;
        info!("web session closed");
    }

    /// Applies idle auto-close, then re-opens or rejects a closed session.
    fn begin_call(&self) -> Result<(), ChatError> {
        let mut lifecycle = lock_unpoisoned(&self.lifecycle);

        if self.auto_close
            && !lifecycle.closed
            && lifecycle.last_activity.elapsed() >= self.close_delay
        {
            self.client.reset_access();
            lifecycle.closed = true;
            info!(
                idle_secs = lifecycle.last_activity.elapsed().as_secs(),
                "web session auto-closed after idle period"
            );
        }

        if lifecycle.closed {
            if !self.auto_re_init {
                return Err(ChatError::Closed);
            }
            lifecycle.closed = false;
            debug!("re-initializing web session");
        }

        lifecycle.last_activity = Instant::now();
        Ok(())
    }

    fn end_call(&self) {
        lock_unpoisoned(&self.lifecycle).last_activity = Instant::now();
    }

    fn execute(
        &self,
        batch: &WireBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<WireFrame>, ChatError> {
        self.begin_call()?;
        let result = self.client.execute(batch, cancel);
        self.end_call();
        result.map_err(map_error)
    }

    fn upload(&self, target: UploadTarget, upload: &Upload) -> Result<String, ChatError> {
        self.begin_call()?;
        let result = self.client.upload(target, upload);
        self.end_call();
        result.map_err(map_error)
    }

    fn execute_single(&self, call: BatchCall) -> Result<WireFrame, ChatError> {
        self.execute(&WireBatch::Execute(vec![call]), None)?
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Protocol("empty batch response".to_owned()))
    }
}

impl ChatBackend for WebBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: WEB_BACKEND_ID.to_owned(),
            endpoint: Some(self.client.endpoint()),
        }
    }

    fn send_batch(
        &self,
        batch: &RpcBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<Frame>, ChatError> {
        let frames = self.execute(&to_wire_batch(batch), cancel)?;
        Ok(frames.into_iter().map(from_wire_frame).collect())
    }

    fn upload_file(&self, upload: &Upload) -> Result<String, ChatError> {
        self.upload(UploadTarget::File, upload)
    }

    fn upload_image(&self, upload: &Upload) -> Result<String, ChatError> {
        self.upload(UploadTarget::Image, upload)
    }

    fn refresh_auth(&self) -> Result<(), ChatError> {
        let Some(source) = &self.cookie_source else {
            return Err(ChatError::AuthRequired);
        };

        let cookies = source.fresh_cookies().map_err(|error| {
            warn!(error = %error, "cookie refresh failed");
            ChatError::AuthRequired
        })?;
        self.client.set_cookies(cookies).map_err(map_error)?;
        info!("session cookies refreshed");
        Ok(())
    }

    fn fetch_gems(&self, include_hidden: bool) -> Result<Vec<Gem>, ChatError> {
        let frames = self.execute(&WireBatch::Execute(list_calls(include_hidden)), None)?;

        let mut gems = Vec::new();
        for (frame, predefined) in frames.iter().zip([true, false]) {
            let Some(payload) = frame.payload.as_deref() else {
                continue;
            };
            let parsed = parse_gem_list(payload, predefined)
                .map_err(|error| ChatError::Parse(error.to_string()))?;
            gems.extend(parsed.into_iter().map(from_wire_gem));
        }
        debug!(count = gems.len(), include_hidden, "fetched gems");
        Ok(gems)
    }

    fn mutate_gem(&self, mutation: &GemMutation) -> Result<Option<Gem>, ChatError> {
        match mutation {
            GemMutation::Create(draft) => {
                let frame = self.execute_single(create_call(
                    &draft.name,
                    &draft.prompt,
                    &draft.description,
                ))?;
                let payload = frame
                    .payload
                    .ok_or_else(|| ChatError::Parse("create response without payload".to_owned()))?;
                let id = parse_created_gem_id(&payload)
                    .map_err(|error| ChatError::Parse(error.to_string()))?;
                Ok(Some(gem_from_draft(id, draft)))
            }
            GemMutation::Update { id, draft } => {
                self.execute_single(update_call(
                    id,
                    &draft.name,
                    &draft.prompt,
                    &draft.description,
                ))?;
                Ok(Some(gem_from_draft(id.clone(), draft)))
            }
            GemMutation::Delete { id } => {
                self.execute_single(delete_call(id))?;
                Ok(None)
            }
        }
    }
}

fn to_wire_batch(batch: &RpcBatch) -> WireBatch {
    match batch {
        RpcBatch::Generate(request) => {
            let [cid, rid, rcid] = request.tokens.as_array();
            let mut call = GenerateCall::new(request.prompt.clone()).with_metadata(cid, rid, rcid);
            call.files = request
                .attachments
                .iter()
                .map(|handle| FileRef::new(handle.id.clone(), handle.name.clone()))
                .collect();
            if let Some(model_id) = model_wire_id(request.model) {
                call = call.with_model_id(model_id);
            }
            if let Some(gem_id) = &request.gem_id {
                call = call.with_gem(gem_id.clone());
            }
            WireBatch::Generate(call)
        }
        RpcBatch::Execute(calls) => WireBatch::Execute(calls.iter().map(to_batch_call).collect()),
    }
}

fn to_batch_call(call: &RpcCall) -> BatchCall {
    BatchCall::new(call.rpc_id.clone(), call.payload.clone(), call.identifier.clone())
}

fn from_wire_frame(frame: WireFrame) -> Frame {
    Frame {
        rpc_id: frame.rpc_id,
        payload: frame.payload,
        identifier: frame.identifier,
        error_code: frame.error_code,
    }
}

fn from_wire_gem(gem: WireGem) -> Gem {
    Gem {
        id: gem.id,
        name: gem.name,
        description: gem.description,
        prompt: gem.prompt,
        predefined: gem.predefined,
    }
}

fn gem_from_draft(id: String, draft: &GemDraft) -> Gem {
    let non_empty = |value: &str| Some(value.trim().to_owned()).filter(|value| !value.is_empty());
    Gem {
        id,
        name: draft.name.clone(),
        description: non_empty(&draft.description),
        prompt: non_empty(&draft.prompt),
        predefined: false,
    }
}

/// Map transport failures onto the shared taxonomy.
fn map_error(error: WebApiError) -> ChatError {
    match error {
        WebApiError::MissingCookies | WebApiError::AuthRequired => ChatError::AuthRequired,
        WebApiError::RateLimited { retry_after } => ChatError::RateLimited {
            retry_hint: retry_after.map(|value| format!("retry after {value}")),
        },
        WebApiError::Cancelled => ChatError::Cancelled,
        error if error.is_transient() => ChatError::Transient(error.to_string()),
        error => ChatError::Protocol(error.to_string()),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
