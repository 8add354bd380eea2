//! Turn-level conversation state machine.
//!
//! A [`Session`] owns the continuation tokens of one server thread and the
//! last parsed output. At most one send is in flight; a concurrent send
//! fails with `Busy`. When bound to a [`HistoryStore`], the user turn is
//! persisted before dispatch, and tokens followed by the assistant turn are
//! persisted after a successful parse. Failures leave the user turn in
//! place and the tokens untouched.

use std::sync::{Arc, Mutex, MutexGuard};

use chat_provider::{
    AttachmentHandle, CancelSignal, Candidate, ChatBackend, ChatError, ContinuationTokens,
    Frame, GenerateRequest, Model, ModelOutput, RpcBatch,
};
use history_store::{Conversation, HistoryStore, ImageRef, NewMessage};
use tracing::{debug, info, warn};

use crate::error::storage_error;
use crate::parser::parse_generate_response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Closed,
}

/// One outgoing user turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub attachments: Vec<AttachmentHandle>,
    /// Model for this turn only.
    pub model: Option<Model>,
    pub cancel: Option<CancelSignal>,
}

impl TurnRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: Vec::new(),
            model: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<AttachmentHandle>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    tokens: ContinuationTokens,
    model: Model,
    gem_id: Option<String>,
    conversation_id: Option<String>,
    last_output: Option<ModelOutput>,
}

pub struct Session {
    backend: Arc<dyn ChatBackend>,
    history: Option<Arc<HistoryStore>>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.profile().backend_id)
            .field("inner", &*self.lock_inner())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session that keeps nothing on disk.
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, model: Model) -> Self {
        Self::build(backend, None, model)
    }

    /// Creates a session bound to `history`. The conversation record is
    /// created by the first send.
    #[must_use]
    pub fn with_history(
        backend: Arc<dyn ChatBackend>,
        history: Arc<HistoryStore>,
        model: Model,
    ) -> Self {
        Self::build(backend, Some(history), model)
    }

    /// Resumes a stored conversation with its model, persona and tokens.
    #[must_use]
    pub fn restore(
        backend: Arc<dyn ChatBackend>,
        history: Arc<HistoryStore>,
        conversation: &Conversation,
    ) -> Self {
        let session = Self::build(backend, Some(history), conversation.model);
        {
            let mut inner = session.lock_inner();
            inner.tokens = conversation.tokens.clone();
            inner.gem_id = conversation.gem_id.clone();
            inner.conversation_id = Some(conversation.id.clone());
        }
        info!(conversation = %conversation.id, model = %conversation.model, "session restored");
        session
    }

    fn build(
        backend: Arc<dyn ChatBackend>,
        history: Option<Arc<HistoryStore>>,
        model: Model,
    ) -> Self {
        Self {
            backend,
            history,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                tokens: ContinuationTokens::default(),
                model,
                gem_id: None,
                conversation_id: None,
                last_output: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    #[must_use]
    pub fn model(&self) -> Model {
        self.lock_inner().model
    }

    #[must_use]
    pub fn gem_id(&self) -> Option<String> {
        self.lock_inner().gem_id.clone()
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.lock_inner().conversation_id.clone()
    }

    #[must_use]
    pub fn last_output(&self) -> Option<ModelOutput> {
        self.lock_inner().last_output.clone()
    }

    /// Current continuation tokens.
    #[must_use]
    pub fn metadata(&self) -> ContinuationTokens {
        self.lock_inner().tokens.clone()
    }

    /// Replaces the tokens wholesale, for restoring a thread.
    pub fn set_metadata(&self, tokens: ContinuationTokens) -> Result<(), ChatError> {
        let mut inner = self.lock_inner();
        ensure_idle(&inner)?;
        inner.tokens = tokens;
        Ok(())
    }

    /// Sends one turn and blocks until the reply is parsed.
    pub fn send(&self, request: TurnRequest) -> Result<ModelOutput, ChatError> {
        let snapshot = {
            let mut inner = self.lock_inner();
            ensure_idle(&inner)?;
            inner.state = SessionState::Sending;
            TurnSnapshot {
                tokens: inner.tokens.clone(),
                model: request.model.unwrap_or(inner.model),
                session_model: inner.model,
                gem_id: inner.gem_id.clone(),
                conversation_id: inner.conversation_id.clone(),
            }
        };
        let _sending = SendingGuard { session: self };

        let conversation_id = self.persist_user_turn(&snapshot, &request)?;

        let batch = RpcBatch::Generate(GenerateRequest {
            prompt: request.prompt.clone(),
            attachments: request.attachments.clone(),
            tokens: snapshot.tokens.clone(),
            model: snapshot.model,
            gem_id: snapshot.gem_id.clone(),
        });
        debug!(
            model = %snapshot.model,
            attachments = request.attachments.len(),
            new_thread = snapshot.tokens.is_new(),
            "dispatching turn"
        );

        let frames = self
            .dispatch(&batch, request.cancel.as_ref())
            .inspect_err(|error| warn!(kind = %error.kind(), %error, "turn failed"))?;
        let turn = parse_generate_response(&frames)
            .inspect_err(|error| warn!(kind = %error.kind(), %error, "turn reply unreadable"))?;

        let tokens = {
            let mut inner = self.lock_inner();
            inner.tokens.merge(&turn.tokens);
            inner.last_output = Some(turn.output.clone());
            inner.tokens.clone()
        };
        info!(candidates = turn.output.candidates().len(), "turn completed");

        if let (Some(history), Some(id)) = (&self.history, conversation_id.as_deref()) {
            history.update_tokens(id, &tokens).map_err(storage_error)?;
            history
                .append_message(id, assistant_message(&turn.output))
                .map_err(storage_error)?;
        }

        Ok(turn.output)
    }

    /// Selects another candidate of the last reply. Threading continues
    /// from the chosen candidate. The store is written first; the session
    /// only changes once both writes succeed.
    pub fn choose_candidate(&self, index: usize) -> Result<Candidate, ChatError> {
        let mut inner = self.lock_inner();
        ensure_idle(&inner)?;
        let mut output = inner
            .last_output
            .clone()
            .ok_or_else(|| ChatError::NotFound("no reply to choose from".to_owned()))?;
        let candidate = output
            .choose(index)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("candidate {index}")))?;
        let tokens = inner
            .tokens
            .clone()
            .merged(&ContinuationTokens::new("", "", candidate.rcid.as_str()));

        if let (Some(history), Some(id)) = (&self.history, inner.conversation_id.as_deref()) {
            history
                .record_candidate_choice(id, assistant_message(&output))
                .map_err(storage_error)?;
            history.update_tokens(id, &tokens).map_err(storage_error)?;
        }

        inner.last_output = Some(output);
        inner.tokens = tokens;
        debug!(index, "candidate chosen");
        Ok(candidate)
    }

    /// Switches the model for later turns. Tokens are kept.
    pub fn set_model(&self, model: Model) -> Result<(), ChatError> {
        let conversation_id = {
            let mut inner = self.lock_inner();
            ensure_open(&inner)?;
            inner.model = model;
            inner.conversation_id.clone()
        };
        if let (Some(history), Some(id)) = (&self.history, conversation_id.as_deref()) {
            history.set_model(id, model).map_err(storage_error)?;
        }
        Ok(())
    }

    /// Binds or clears the persona for later turns.
    pub fn set_gem(&self, gem_id: Option<String>) -> Result<(), ChatError> {
        let conversation_id = {
            let mut inner = self.lock_inner();
            ensure_open(&inner)?;
            inner.gem_id = gem_id.clone();
            inner.conversation_id.clone()
        };
        if let (Some(history), Some(id)) = (&self.history, conversation_id.as_deref()) {
            history.set_gem(id, gem_id.as_deref()).map_err(storage_error)?;
        }
        Ok(())
    }

    /// Idempotent. Later sends fail with `Closed`.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        if inner.state != SessionState::Closed {
            inner.state = SessionState::Closed;
            info!("session closed");
        }
    }

    /// Writes the user turn, creating the conversation on first use.
    fn persist_user_turn(
        &self,
        snapshot: &TurnSnapshot,
        request: &TurnRequest,
    ) -> Result<Option<String>, ChatError> {
        let Some(history) = &self.history else {
            return Ok(None);
        };

        let id = match &snapshot.conversation_id {
            Some(id) => id.clone(),
            None => {
                let conversation = history
                    .create(snapshot.session_model)
                    .map_err(storage_error)?;
                if snapshot.gem_id.is_some() {
                    history
                        .set_gem(&conversation.id, snapshot.gem_id.as_deref())
                        .map_err(storage_error)?;
                }
                self.bind_conversation(
                    history,
                    &conversation.id,
                    snapshot.session_model,
                    snapshot.gem_id.as_deref(),
                )?;
                conversation.id
            }
        };

        let attachment_names = request
            .attachments
            .iter()
            .map(|handle| handle.name.clone())
            .collect();
        history
            .append_message(
                &id,
                NewMessage::user(request.prompt.clone()).with_attachments(attachment_names),
            )
            .map_err(storage_error)?;
        Ok(Some(id))
    }

    /// Publishes a freshly created conversation id. Model or persona changes
    /// made while the record was being created are written under the same
    /// lock; later changes see the id and persist themselves.
    fn bind_conversation(
        &self,
        history: &HistoryStore,
        id: &str,
        created_model: Model,
        created_gem: Option<&str>,
    ) -> Result<(), ChatError> {
        let mut inner = self.lock_inner();
        inner.conversation_id = Some(id.to_owned());
        if inner.model != created_model {
            history.set_model(id, inner.model).map_err(storage_error)?;
        }
        if inner.gem_id.as_deref() != created_gem {
            history
                .set_gem(id, inner.gem_id.as_deref())
                .map_err(storage_error)?;
        }
        Ok(())
    }

    /// Sends the batch, refreshing authentication once on `AuthRequired`.
    fn dispatch(
        &self,
        batch: &RpcBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<Frame>, ChatError> {
        match self.backend.send_batch(batch, cancel) {
            Err(ChatError::AuthRequired) => {
                info!("authentication required; refreshing once");
                if let Err(error) = self.backend.refresh_auth() {
                    warn!(%error, "authentication refresh failed");
                    return Err(ChatError::AuthRequired);
                }
                self.backend.send_batch(batch, cancel)
            }
            other => other,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        lock_unpoisoned(&self.inner)
    }
}

struct TurnSnapshot {
    tokens: ContinuationTokens,
    /// Model of this turn, including a per-turn override.
    model: Model,
    session_model: Model,
    gem_id: Option<String>,
    conversation_id: Option<String>,
}

/// Returns the session to `Idle` when a send ends, unless it was closed.
struct SendingGuard<'a> {
    session: &'a Session,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.lock_inner();
        if inner.state == SessionState::Sending {
            inner.state = SessionState::Idle;
        }
    }
}

fn ensure_idle(inner: &SessionInner) -> Result<(), ChatError> {
    match inner.state {
        SessionState::Idle => Ok(()),
        SessionState::Sending => Err(ChatError::Busy),
        SessionState::Closed => Err(ChatError::Closed),
    }
}

fn ensure_open(inner: &SessionInner) -> Result<(), ChatError> {
    if inner.state == SessionState::Closed {
        Err(ChatError::Closed)
    } else {
        Ok(())
    }
}

/// History record for the selected candidate of `output`.
#[must_use]
pub fn assistant_message(output: &ModelOutput) -> NewMessage {
    let candidate = output.chosen_candidate();
    let images = candidate
        .web_images
        .iter()
        .map(ImageRef::from)
        .chain(candidate.generated_images.iter().map(ImageRef::from))
        .collect();

    NewMessage::assistant(candidate.text.clone())
        .with_thoughts(candidate.thoughts.clone())
        .with_images(images)
        .with_candidate_index(output.chosen())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
