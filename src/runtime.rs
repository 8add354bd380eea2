//! Worker runtime between the shell and the engine.
//!
//! The controller owns the session, the attachment manager, the persona
//! registry and the store. Sends, uploads, gem fetches and store work run on
//! named worker threads; their results come back as [`UiEvent`]s on a
//! channel the UI drains on its own thread.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chat_provider::{
    cancel_signal, AttachmentHandle, AttachmentKind, CancelSignal, Candidate, ChatError, Gem,
    Model, ModelOutput,
};
use history_store::{ConversationSummary, HistoryStore};
use tracing::{debug, warn};

use crate::attachments::AttachmentManager;
use crate::commands::ExportFormat;
use crate::error::storage_error;
use crate::gems::{GemJar, GemRegistry};
use crate::session::{Session, TurnRequest};

pub type SendId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    SendStarted {
        send_id: SendId,
        attachments: usize,
    },
    Reply {
        send_id: SendId,
        output: ModelOutput,
    },
    SendFailed {
        send_id: SendId,
        error: ChatError,
    },
    AttachmentAdded(AttachmentHandle),
    GemsLoaded(GemJar),
    GemSelected(Option<Gem>),
    HistoryLoaded(Vec<ConversationSummary>),
    Exported {
        path: PathBuf,
        format: ExportFormat,
    },
    CandidateChosen {
        index: usize,
        candidate: Candidate,
    },
    ModelChanged(Model),
    /// Failure of a background task other than a send.
    TaskFailed {
        task: &'static str,
        error: ChatError,
    },
}

impl UiEvent {
    /// Whether this event ends the send `send_id`.
    #[must_use]
    pub fn ends_send(&self, send_id: SendId) -> bool {
        matches!(
            self,
            Self::Reply { send_id: id, .. } | Self::SendFailed { send_id: id, .. } if *id == send_id
        )
    }
}

struct ActiveSend {
    send_id: SendId,
    cancel: CancelSignal,
    join_handle: JoinHandle<()>,
}

pub struct ChatController {
    session: Arc<Session>,
    attachments: AttachmentManager,
    gems: GemRegistry,
    history: Option<Arc<HistoryStore>>,
    pending: Mutex<Vec<AttachmentHandle>>,
    active_send: Mutex<Option<ActiveSend>>,
    /// Worker of the last completed send, joined by the next submit.
    finished_send: Mutex<Option<JoinHandle<()>>>,
    next_send_id: AtomicU64,
    events: Sender<UiEvent>,
}

impl ChatController {
    /// Creates the controller and the receiving end of its event queue.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        attachments: AttachmentManager,
        gems: GemRegistry,
        history: Option<Arc<HistoryStore>>,
    ) -> (Arc<Self>, Receiver<UiEvent>) {
        let (events, receiver) = mpsc::channel();
        let controller = Arc::new(Self {
            session,
            attachments,
            gems,
            history,
            pending: Mutex::new(Vec::new()),
            active_send: Mutex::new(None),
            finished_send: Mutex::new(None),
            next_send_id: AtomicU64::new(1),
            events,
        });
        (controller, receiver)
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn gems(&self) -> &GemRegistry {
        &self.gems
    }

    #[must_use]
    pub fn history(&self) -> Option<&Arc<HistoryStore>> {
        self.history.as_ref()
    }

    #[must_use]
    pub fn pending_attachments(&self) -> Vec<AttachmentHandle> {
        lock_unpoisoned(&self.pending).clone()
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        lock_unpoisoned(&self.active_send).is_some()
    }

    /// Starts a send on a worker. Pending attachments go with it and are
    /// dropped whatever the outcome.
    pub fn submit(self: &Arc<Self>, prompt: impl Into<String>) -> Result<SendId, ChatError> {
        let mut active_send = lock_unpoisoned(&self.active_send);
        if active_send.is_some() {
            return Err(ChatError::Busy);
        }

        if let Some(previous) = lock_unpoisoned(&self.finished_send).take() {
            // Past `clear_active_send` the worker only publishes its last event.
            if previous.join().is_err() {
                warn!("previous send worker panicked");
            }
        }

        let send_id = self.next_send_id.fetch_add(1, Ordering::SeqCst);
        let cancel = cancel_signal();
        let attachments = std::mem::take(&mut *lock_unpoisoned(&self.pending));
        let request = TurnRequest::new(prompt)
            .with_attachments(attachments)
            .with_cancel(Arc::clone(&cancel));

        let controller = Arc::clone(self);
        let join_handle = thread::Builder::new()
            .name(format!("gem-chat-send-{send_id}"))
            .spawn(move || controller.run_send(send_id, request))
            .map_err(|error| {
                ChatError::Protocol(format!("failed to spawn send worker: {error}"))
            })?;

        *active_send = Some(ActiveSend {
            send_id,
            cancel,
            join_handle,
        });
        Ok(send_id)
    }

    /// Raises the cancellation signal of the active send. Returns false
    /// when nothing is in flight.
    pub fn cancel_send(&self) -> bool {
        match lock_unpoisoned(&self.active_send).as_ref() {
            Some(active) => {
                active.cancel.store(true, Ordering::Release);
                debug!(send_id = active.send_id, "send cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Uploads `path` on a worker and queues the handle for the next send.
    pub fn attach(self: &Arc<Self>, path: PathBuf, kind: Option<AttachmentKind>) {
        self.spawn_task("attach", move |controller| {
            let handle = match kind {
                Some(kind) => controller.attachments.upload_as(&path, kind)?,
                None => controller.attachments.upload(&path)?,
            };
            lock_unpoisoned(&controller.pending).push(handle.clone());
            Ok(UiEvent::AttachmentAdded(handle))
        });
    }

    /// Drops pending attachments. Returns how many were dropped.
    pub fn clear_attachments(&self) -> usize {
        let mut pending = lock_unpoisoned(&self.pending);
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    pub fn load_gems(self: &Arc<Self>, include_hidden: bool) {
        self.spawn_task("gems", move |controller| {
            Ok(UiEvent::GemsLoaded(controller.gems.fetch(include_hidden)?))
        });
    }

    /// Binds a persona by id or name. Names resolve through the cached
    /// catalog, fetching it once when empty.
    pub fn set_gem(self: &Arc<Self>, id_or_name: Option<String>) {
        self.spawn_task("gem", move |controller| {
            let Some(id_or_name) = id_or_name else {
                controller.session.set_gem(None)?;
                return Ok(UiEvent::GemSelected(None));
            };
            if controller.gems.jar().is_empty() {
                controller.gems.fetch(false)?;
            }
            let gem = controller
                .gems
                .get(&id_or_name)
                .ok_or_else(|| ChatError::NotFound(format!("gem '{id_or_name}'")))?;
            controller.session.set_gem(Some(gem.id.clone()))?;
            Ok(UiEvent::GemSelected(Some(gem)))
        });
    }

    pub fn load_history(self: &Arc<Self>) {
        self.spawn_task("history", move |controller| {
            let history = controller.require_history()?;
            Ok(UiEvent::HistoryLoaded(history.list()))
        });
    }

    /// Writes the current conversation to `path`.
    pub fn export(self: &Arc<Self>, path: PathBuf, format: ExportFormat) {
        self.spawn_task("export", move |controller| {
            let history = controller.require_history()?;
            let id = controller
                .session
                .conversation_id()
                .ok_or_else(|| ChatError::NotFound("no conversation to export yet".to_owned()))?;
            export_conversation(history, &id, &path, format)?;
            Ok(UiEvent::Exported { path, format })
        });
    }

    pub fn choose_candidate(self: &Arc<Self>, index: usize) {
        self.spawn_task("choose", move |controller| {
            let candidate = controller.session.choose_candidate(index)?;
            Ok(UiEvent::CandidateChosen { index, candidate })
        });
    }

    pub fn set_model(self: &Arc<Self>, model: Model) {
        self.spawn_task("model", move |controller| {
            controller.session.set_model(model)?;
            Ok(UiEvent::ModelChanged(model))
        });
    }

    fn run_send(self: Arc<Self>, send_id: SendId, request: TurnRequest) {
        self.emit(UiEvent::SendStarted {
            send_id,
            attachments: request.attachments.len(),
        });

        let session = Arc::clone(&self.session);
        let outcome = catch_unwind(AssertUnwindSafe(move || session.send(request)));
        // Cleared before the terminal event so the UI may submit right away.
        self.clear_active_send(send_id);

        let event = match outcome {
            Ok(Ok(output)) => UiEvent::Reply { send_id, output },
            Ok(Err(error)) => UiEvent::SendFailed { send_id, error },
            Err(_) => UiEvent::SendFailed {
                send_id,
                error: ChatError::Protocol("send worker panicked".to_owned()),
            },
        };
        self.emit(event);
    }

    fn spawn_task<F>(self: &Arc<Self>, task: &'static str, work: F)
    where
        F: FnOnce(&ChatController) -> Result<UiEvent, ChatError> + Send + 'static,
    {
        let controller = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("gem-chat-{task}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| work(&controller)));
                let event = match outcome {
                    Ok(Ok(event)) => event,
                    Ok(Err(error)) => UiEvent::TaskFailed { task, error },
                    Err(_) => UiEvent::TaskFailed {
                        task,
                        error: ChatError::Protocol(format!("{task} worker panicked")),
                    },
                };
                controller.emit(event);
            });

        if let Err(error) = spawned {
            self.emit(UiEvent::TaskFailed {
                task,
                error: ChatError::Protocol(format!("failed to spawn {task} worker: {error}")),
            });
        }
    }

    fn clear_active_send(&self, send_id: SendId) {
        let mut active_send = lock_unpoisoned(&self.active_send);
        if active_send.as_ref().map(|active| active.send_id) != Some(send_id) {
            return;
        }
        if let Some(completed) = active_send.take() {
            *lock_unpoisoned(&self.finished_send) = Some(completed.join_handle);
        }
    }

    fn require_history(&self) -> Result<&HistoryStore, ChatError> {
        self.history
            .as_deref()
            .ok_or_else(|| ChatError::Unsupported("history is disabled".to_owned()))
    }

    fn emit(&self, event: UiEvent) {
        if let UiEvent::TaskFailed { task, error } = &event {
            warn!(task, kind = %error.kind(), %error, "background task failed");
        }
        if self.events.send(event).is_err() {
            debug!("ui event dropped; receiver gone");
        }
    }
}

/// Renders `id` in `format` and writes it to `path`.
pub fn export_conversation(
    history: &HistoryStore,
    id: &str,
    path: &Path,
    format: ExportFormat,
) -> Result<(), ChatError> {
    let bytes = match format {
        ExportFormat::Md => history.export_markdown(id).map_err(storage_error)?.into_bytes(),
        ExportFormat::Json => history.export_json(id).map_err(storage_error)?,
    };
    fs::write(path, bytes)
        .map_err(|error| ChatError::Storage(format!("writing {}: {error}", path.display())))
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
