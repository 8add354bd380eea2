//! Provider-neutral contract for the conversation engine.
//!
//! This crate defines the value types shared by the engine (continuation
//! tokens, parsed model output, personas, attachment handles), wire-neutral
//! carriers for outbound RPC batches and inbound frames, the error taxonomy,
//! and the narrow [`ChatBackend`] capability set the session depends on.
//! It contains no transport code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod attachment;
mod error;
mod gem;
mod model;
mod output;
mod tokens;

pub use attachment::{AttachmentHandle, AttachmentKind, Upload};
pub use error::{ChatError, ErrorKind};
pub use gem::{Gem, GemDraft, GemMutation};
pub use model::Model;
pub use output::{Candidate, GeneratedImage, ModelOutput, WebImage};
pub use tokens::ContinuationTokens;

/// Shared cancellation flag for one request.
pub type CancelSignal = Arc<AtomicBool>;

/// Creates a fresh, unset cancellation signal.
#[must_use]
pub fn cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Returns true when the optional signal has been raised.
#[must_use]
pub fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(|signal| signal.load(Ordering::Acquire))
}

/// One conversational turn to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub attachments: Vec<AttachmentHandle>,
    pub tokens: ContinuationTokens,
    pub model: Model,
    pub gem_id: Option<String>,
}

/// One entry of a batch RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub rpc_id: String,
    /// JSON-encoded argument string, sent verbatim.
    pub payload: String,
    /// Disambiguates repeated calls to the same `rpc_id` within a batch.
    pub identifier: String,
}

impl RpcCall {
    #[must_use]
    pub fn new(rpc_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            payload: payload.into(),
            identifier: "generic".to_owned(),
        }
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

/// Ordered outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcBatch {
    Generate(GenerateRequest),
    Execute(Vec<RpcCall>),
}

/// One decoded response frame. Frames come back in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub rpc_id: Option<String>,
    /// The JSON-encoded payload string carried in the frame's third slot.
    pub payload: Option<String>,
    pub identifier: Option<String>,
    /// Service-level error code carried by failed frames.
    pub error_code: Option<i64>,
}

impl Frame {
    #[must_use]
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }
}

/// Immutable metadata describing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub backend_id: String,
    pub endpoint: Option<String>,
}

/// Narrow capability set the conversation engine depends on.
///
/// Implementations are called from worker threads and block until the
/// remote call completes.
pub trait ChatBackend: Send + Sync + 'static {
    /// Returns backend identity metadata.
    fn profile(&self) -> BackendProfile;

    /// Dispatches an ordered batch and returns the raw frames in request order.
    fn send_batch(
        &self,
        batch: &RpcBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<Frame>, ChatError>;

    /// Uploads a generic file and returns the server-issued id.
    fn upload_file(&self, upload: &Upload) -> Result<String, ChatError>;

    /// Uploads an image and returns the server-issued id.
    fn upload_image(&self, upload: &Upload) -> Result<String, ChatError>;

    /// Refreshes authentication material.
    ///
    /// Backends without a refresh source report `AuthRequired`.
    fn refresh_auth(&self) -> Result<(), ChatError> {
        Err(ChatError::AuthRequired)
    }

    /// Lists personas; `include_hidden` adds hidden system personas.
    fn fetch_gems(&self, include_hidden: bool) -> Result<Vec<Gem>, ChatError>;

    /// Applies a persona mutation. Create and update return the resulting gem.
    fn mutate_gem(&self, mutation: &GemMutation) -> Result<Option<Gem>, ChatError>;
}
