//! Deterministic scripted implementation of the `chat_provider` contract.
//!
//! This crate contains no transport logic. It serves canned frames in
//! order, records every request it sees, and keeps personas in memory. It
//! backs contract-level tests and the offline `mock` backend of the
//! binary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chat_provider::{
    is_cancelled, AttachmentKind, BackendProfile, CancelSignal, ChatBackend, ChatError, Frame,
    Gem, GemMutation, RpcBatch, Upload,
};

mod envelope;

pub use envelope::EnvelopeBuilder;

/// Stable backend identifier used for explicit startup selection.
pub const MOCK_BACKEND_ID: &str = "mock";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome served for one `send_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Frames(Vec<Frame>),
    Fail(ChatError),
}

impl ScriptedReply {
    /// A well-formed reply with one text candidate.
    #[must_use]
    pub fn text(cid: &str, rid: &str, rcid: &str, text: &str) -> Self {
        Self::Frames(EnvelopeBuilder::new(cid, rid).reply(rcid, text).frames())
    }

    /// A reply whose payload is not a valid envelope.
    #[must_use]
    pub fn malformed() -> Self {
        Self::Frames(vec![Frame::with_payload("{\"unexpected\": true")])
    }
}

/// What to do once the script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    Exhausted,
    Echo,
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
}

#[derive(Debug, Default)]
struct RequestLog {
    batches: Vec<RpcBatch>,
}

/// Scripted backend used by engine tests and offline runs.
#[derive(Debug)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Fallback,
    latency: Duration,
    requests: Mutex<RequestLog>,
    request_added: Condvar,
    gate: Mutex<GateState>,
    gate_changed: Condvar,
    refresh_results: Mutex<VecDeque<Result<(), ChatError>>>,
    refresh_calls: AtomicUsize,
    uploads: Mutex<Vec<(AttachmentKind, String)>>,
    gems: Mutex<Vec<Gem>>,
    gem_counter: AtomicUsize,
    echo_counter: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedBackend {
    /// Serves `replies` in order; further calls fail with a protocol error.
    #[must_use]
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: Fallback::Exhausted,
            latency: Duration::ZERO,
            requests: Mutex::new(RequestLog::default()),
            request_added: Condvar::new(),
            gate: Mutex::new(GateState::default()),
            gate_changed: Condvar::new(),
            refresh_results: Mutex::new(VecDeque::new()),
            refresh_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            gems: Mutex::new(Vec::new()),
            gem_counter: AtomicUsize::new(0),
            echo_counter: AtomicUsize::new(0),
        }
    }

    /// Answers every generate request by echoing its prompt.
    #[must_use]
    pub fn echo() -> Self {
        Self {
            fallback: Fallback::Echo,
            ..Self::new(Vec::new())
        }
    }

    /// Sleeps this long before answering; the sleep observes cancellation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_gems(self, gems: Vec<Gem>) -> Self {
        *lock_unpoisoned(&self.gems) = gems;
        self
    }

    /// Queues results for successive `refresh_auth` calls. Once empty,
    /// refreshes succeed.
    #[must_use]
    pub fn with_refresh_results(self, results: Vec<Result<(), ChatError>>) -> Self {
        *lock_unpoisoned(&self.refresh_results) = results.into();
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    /// Makes subsequent `send_batch` calls block until [`Self::open_gate`].
    pub fn close_gate(&self) {
        lock_unpoisoned(&self.gate).closed = true;
    }

    pub fn open_gate(&self) {
        lock_unpoisoned(&self.gate).closed = false;
        self.gate_changed.notify_all();
    }

    /// Every batch received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<RpcBatch> {
        lock_unpoisoned(&self.requests).batches.clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).batches.len()
    }

    /// Blocks until at least `count` requests arrived or `timeout` passes.
    pub fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = lock_unpoisoned(&self.requests);
        while log.batches.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            log = match self.request_added.wait_timeout(log, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Names of uploaded payloads with the path they took.
    #[must_use]
    pub fn uploads(&self) -> Vec<(AttachmentKind, String)> {
        lock_unpoisoned(&self.uploads).clone()
    }

    fn record(&self, batch: &RpcBatch) {
        lock_unpoisoned(&self.requests).batches.push(batch.clone());
        self.request_added.notify_all();
    }

    fn wait_gate(&self, cancel: Option<&CancelSignal>) -> Result<(), ChatError> {
        let mut gate = lock_unpoisoned(&self.gate);
        while gate.closed {
            if is_cancelled(cancel) {
                return Err(ChatError::Cancelled);
            }
            gate = match self.gate_changed.wait_timeout(gate, CANCEL_POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }

    fn wait_latency(&self, cancel: Option<&CancelSignal>) -> Result<(), ChatError> {
        let deadline = Instant::now() + self.latency;
        while Instant::now() < deadline {
            if is_cancelled(cancel) {
                return Err(ChatError::Cancelled);
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    fn echo_reply(&self, batch: &RpcBatch) -> ScriptedReply {
        let RpcBatch::Generate(request) = batch else {
            return ScriptedReply::Frames(Vec::new());
        };
        let turn = self.echo_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cid = if request.tokens.cid().is_empty() {
            format!("c_mock_{turn}")
        } else {
            request.tokens.cid().to_owned()
        };
        let mut text = format!("echo: {}", request.prompt);
        for attachment in &request.attachments {
            text.push_str(&format!("\n[{}: {}]", attachment.kind.as_str(), attachment.name));
        }
        ScriptedReply::text(&cid, &format!("r_mock_{turn}"), &format!("rc_mock_{turn}"), &text)
    }
}

impl ChatBackend for ScriptedBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: MOCK_BACKEND_ID.to_owned(),
            endpoint: None,
        }
    }

    fn send_batch(
        &self,
        batch: &RpcBatch,
        cancel: Option<&CancelSignal>,
    ) -> Result<Vec<Frame>, ChatError> {
        self.record(batch);
        self.wait_gate(cancel)?;
        self.wait_latency(cancel)?;
        if is_cancelled(cancel) {
            return Err(ChatError::Cancelled);
        }

        let scripted = lock_unpoisoned(&self.replies).pop_front();
        let reply = match (scripted, self.fallback) {
            (Some(reply), _) => reply,
            (None, Fallback::Echo) => self.echo_reply(batch),
            (None, Fallback::Exhausted) => {
                ScriptedReply::Fail(ChatError::Protocol("no scripted reply left".to_owned()))
            }
        };

        match reply {
            ScriptedReply::Frames(frames) => Ok(frames),
            ScriptedReply::Fail(error) => Err(error),
        }
    }

    fn upload_file(&self, upload: &Upload) -> Result<String, ChatError> {
        let mut uploads = lock_unpoisoned(&self.uploads);
        uploads.push((AttachmentKind::File, upload.name.clone()));
        Ok(format!("/contrib_service/mock/file-{}", uploads.len()))
    }

    fn upload_image(&self, upload: &Upload) -> Result<String, ChatError> {
        let mut uploads = lock_unpoisoned(&self.uploads);
        uploads.push((AttachmentKind::Image, upload.name.clone()));
        Ok(format!("/contrib_service/mock/image-{}", uploads.len()))
    }

    fn refresh_auth(&self) -> Result<(), ChatError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.refresh_results)
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn fetch_gems(&self, include_hidden: bool) -> Result<Vec<Gem>, ChatError> {
        let _ = include_hidden;
        Ok(lock_unpoisoned(&self.gems).clone())
    }

    fn mutate_gem(&self, mutation: &GemMutation) -> Result<Option<Gem>, ChatError> {
        let mut gems = lock_unpoisoned(&self.gems);
        match mutation {
            GemMutation::Create(draft) => {
                let id = format!(
                    "mock-gem-{}",
                    self.gem_counter.fetch_add(1, Ordering::SeqCst) + 1
                );
                let gem = Gem {
                    id,
                    name: draft.name.clone(),
                    description: non_empty(&draft.description),
                    prompt: non_empty(&draft.prompt),
                    predefined: false,
                };
                gems.push(gem.clone());
                Ok(Some(gem))
            }
            GemMutation::Update { id, draft } => {
                let gem = gems
                    .iter_mut()
                    .find(|gem| &gem.id == id)
                    .ok_or_else(|| ChatError::NotFound(format!("gem {id}")))?;
                gem.name = draft.name.clone();
                gem.description = non_empty(&draft.description);
                gem.prompt = non_empty(&draft.prompt);
                Ok(Some(gem.clone()))
            }
            GemMutation::Delete { id } => {
                let before = gems.len();
                gems.retain(|gem| &gem.id != id);
                if gems.len() == before {
                    return Err(ChatError::NotFound(format!("gem {id}")));
                }
                Ok(None)
            }
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
