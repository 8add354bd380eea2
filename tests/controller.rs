use std::fs;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use chat_provider::{AttachmentKind, Candidate, ChatBackend, ChatError, Gem, Model, RpcBatch};
use chat_provider_mock::{EnvelopeBuilder, ScriptedBackend, ScriptedReply};
use gem_chat::{
    AttachmentManager, ChatController, ExportFormat, GemRegistry, SendId, Session, UiEvent,
};
use history_store::HistoryStore;
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    dir: TempDir,
    backend: Arc<ScriptedBackend>,
    controller: Arc<ChatController>,
    events: Receiver<UiEvent>,
}

fn harness_with(backend: ScriptedBackend, with_history: bool) -> Harness {
    let dir = tempdir().expect("tempdir");
    let backend = Arc::new(backend);
    let dyn_backend = Arc::clone(&backend) as Arc<dyn ChatBackend>;
    let history = with_history.then(|| {
        Arc::new(HistoryStore::open(&dir.path().join("history")).expect("open store"))
    });
    let session = match &history {
        Some(store) => {
            Session::with_history(Arc::clone(&dyn_backend), Arc::clone(store), Model::Flash25)
        }
        None => Session::new(Arc::clone(&dyn_backend), Model::Flash25),
    };
    let (controller, events) = ChatController::new(
        Arc::new(session),
        AttachmentManager::new(Arc::clone(&dyn_backend)),
        GemRegistry::new(dyn_backend),
        history,
    );
    Harness {
        dir,
        backend,
        controller,
        events,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedBackend::echo(), true)
}

fn next_event(events: &Receiver<UiEvent>) -> UiEvent {
    events.recv_timeout(WAIT).expect("event within timeout")
}

fn await_send(events: &Receiver<UiEvent>, send_id: SendId) -> UiEvent {
    loop {
        let event = next_event(events);
        if event.ends_send(send_id) {
            return event;
        }
    }
}

fn send_and_wait(harness: &Harness, prompt: &str) -> UiEvent {
    let send_id = harness.controller.submit(prompt).expect("submit");
    await_send(&harness.events, send_id)
}

fn persona(id: &str, name: &str) -> Gem {
    Gem {
        id: id.to_owned(),
        name: name.to_owned(),
        description: None,
        prompt: Some("be brief".to_owned()),
        predefined: false,
    }
}

#[test]
fn submit_reports_start_then_reply() {
    let harness = harness();

    let send_id = harness.controller.submit("hello").expect("submit");
    assert_eq!(
        next_event(&harness.events),
        UiEvent::SendStarted {
            send_id,
            attachments: 0
        }
    );
    match next_event(&harness.events) {
        UiEvent::Reply { send_id: id, output } => {
            assert_eq!(id, send_id);
            assert_eq!(output.text(), "echo: hello");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!harness.controller.is_sending());
}

#[test]
fn consecutive_sends_each_get_a_fresh_worker() {
    let harness = harness();

    for prompt in ["one", "two", "three"] {
        match send_and_wait(&harness, prompt) {
            UiEvent::Reply { output, .. } => assert_eq!(output.text(), format!("echo: {prompt}")),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(harness.backend.request_count(), 3);
    assert!(!harness.controller.is_sending());
}

#[test]
fn second_submit_is_busy_while_first_is_in_flight() {
    let harness = harness();
    harness.backend.close_gate();

    let first = harness.controller.submit("one").expect("submit");
    assert!(harness.backend.wait_for_requests(1, WAIT));
    assert!(harness.controller.is_sending());
    assert_eq!(harness.controller.submit("two"), Err(ChatError::Busy));

    harness.backend.open_gate();
    assert!(matches!(
        await_send(&harness.events, first),
        UiEvent::Reply { .. }
    ));
    assert_eq!(harness.backend.request_count(), 1);
}

#[test]
fn cancel_send_fails_the_active_send() {
    let harness = harness();
    assert!(!harness.controller.cancel_send());

    harness.backend.close_gate();
    let send_id = harness.controller.submit("slow").expect("submit");
    assert!(harness.backend.wait_for_requests(1, WAIT));
    assert!(harness.controller.cancel_send());

    assert_eq!(
        await_send(&harness.events, send_id),
        UiEvent::SendFailed {
            send_id,
            error: ChatError::Cancelled
        }
    );
    assert!(!harness.controller.is_sending());
}

#[test]
fn attachments_queue_until_the_next_send() {
    let harness = harness();
    let path = harness.dir.path().join("notes.txt");
    fs::write(&path, "some notes").expect("write");

    harness.controller.attach(path, None);
    match next_event(&harness.events) {
        UiEvent::AttachmentAdded(handle) => {
            assert_eq!(handle.kind, AttachmentKind::File);
            assert_eq!(handle.name, "notes.txt");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(harness.controller.pending_attachments().len(), 1);

    let send_id = harness.controller.submit("summarize").expect("submit");
    assert_eq!(
        next_event(&harness.events),
        UiEvent::SendStarted {
            send_id,
            attachments: 1
        }
    );
    assert!(harness.controller.pending_attachments().is_empty());
    await_send(&harness.events, send_id);

    let requests = harness.backend.requests();
    let RpcBatch::Generate(request) = &requests[0] else {
        panic!("expected a generate request");
    };
    assert_eq!(request.attachments.len(), 1);
    assert_eq!(request.attachments[0].name, "notes.txt");
}

#[test]
fn clear_drops_pending_attachments() {
    let harness = harness();
    let path = harness.dir.path().join("a.txt");
    fs::write(&path, "a").expect("write");

    harness.controller.attach(path, None);
    next_event(&harness.events);
    assert_eq!(harness.controller.clear_attachments(), 1);
    assert_eq!(harness.controller.clear_attachments(), 0);

    send_and_wait(&harness, "no files");
    let requests = harness.backend.requests();
    let RpcBatch::Generate(request) = &requests[0] else {
        panic!("expected a generate request");
    };
    assert!(request.attachments.is_empty());
}

#[test]
fn missing_attachment_reports_task_failure() {
    let harness = harness();
    let path = harness.dir.path().join("absent.png");

    harness.controller.attach(path, Some(AttachmentKind::Image));
    match next_event(&harness.events) {
        UiEvent::TaskFailed { task, error } => {
            assert_eq!(task, "attach");
            assert!(matches!(error, ChatError::NotFound(_)));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(harness.controller.pending_attachments().is_empty());
}

#[test]
fn gems_load_and_bind_by_name() {
    let backend = ScriptedBackend::echo().with_gems(vec![
        persona("g-1", "Tutor"),
        persona("g-2", "Editor"),
    ]);
    let harness = harness_with(backend, true);

    harness.controller.set_gem(Some("editor".to_owned()));
    assert_eq!(
        next_event(&harness.events),
        UiEvent::GemSelected(Some(persona("g-2", "Editor")))
    );
    assert_eq!(harness.controller.session().gem_id().as_deref(), Some("g-2"));

    harness.controller.load_gems(false);
    match next_event(&harness.events) {
        UiEvent::GemsLoaded(jar) => assert_eq!(jar.len(), 2),
        other => panic!("unexpected event {other:?}"),
    }

    harness.controller.set_gem(None);
    assert_eq!(next_event(&harness.events), UiEvent::GemSelected(None));
    assert_eq!(harness.controller.session().gem_id(), None);
}

#[test]
fn unknown_gem_name_is_not_found() {
    let harness = harness_with(
        ScriptedBackend::echo().with_gems(vec![persona("g-1", "Tutor")]),
        true,
    );

    harness.controller.set_gem(Some("Poet".to_owned()));
    assert!(matches!(
        next_event(&harness.events),
        UiEvent::TaskFailed {
            task: "gem",
            error: ChatError::NotFound(_)
        }
    ));
}

#[test]
fn history_lists_the_conversation_after_a_send() {
    let harness = harness();
    send_and_wait(&harness, "first question");

    harness.controller.load_history();
    match next_event(&harness.events) {
        UiEvent::HistoryLoaded(summaries) => {
            assert_eq!(summaries.len(), 1);
            assert_eq!(summaries[0].title, "first question");
            assert_eq!(
                Some(summaries[0].id.clone()),
                harness.controller.session().conversation_id()
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn export_writes_markdown_and_json() {
    let harness = harness();
    send_and_wait(&harness, "what is rust?");

    let markdown = harness.dir.path().join("chat.md");
    harness.controller.export(markdown.clone(), ExportFormat::Md);
    assert_eq!(
        next_event(&harness.events),
        UiEvent::Exported {
            path: markdown.clone(),
            format: ExportFormat::Md
        }
    );
    let text = fs::read_to_string(&markdown).expect("read md");
    assert!(text.contains("what is rust?"));
    assert!(text.contains("echo: what is rust?"));

    let json = harness.dir.path().join("chat.json");
    harness.controller.export(json.clone(), ExportFormat::Json);
    next_event(&harness.events);
    let value: serde_json::Value =
        serde_json::from_slice(&fs::read(&json).expect("read json")).expect("valid json");
    assert!(value.is_object());
}

#[test]
fn export_before_any_turn_is_not_found() {
    let harness = harness();
    harness
        .controller
        .export(harness.dir.path().join("empty.md"), ExportFormat::Md);
    assert!(matches!(
        next_event(&harness.events),
        UiEvent::TaskFailed {
            task: "export",
            error: ChatError::NotFound(_)
        }
    ));
}

#[test]
fn history_operations_need_a_store() {
    let harness = harness_with(ScriptedBackend::echo(), false);

    harness.controller.load_history();
    assert!(matches!(
        next_event(&harness.events),
        UiEvent::TaskFailed {
            task: "history",
            error: ChatError::Unsupported(_)
        }
    ));

    assert!(matches!(
        send_and_wait(&harness, "still works"),
        UiEvent::Reply { .. }
    ));
}

#[test]
fn choose_candidate_switches_the_reply() {
    let frames = EnvelopeBuilder::new("C1", "R1")
        .candidate(&Candidate::text("RC-a", "first draft"))
        .candidate(&Candidate::text("RC-b", "second draft"))
        .frames();
    let harness = harness_with(ScriptedBackend::new(vec![ScriptedReply::Frames(frames)]), true);
    send_and_wait(&harness, "draft something");

    harness.controller.choose_candidate(1);
    match next_event(&harness.events) {
        UiEvent::CandidateChosen { index, candidate } => {
            assert_eq!(index, 1);
            assert_eq!(candidate.text, "second draft");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(harness.controller.session().metadata().rcid(), "RC-b");

    harness.controller.choose_candidate(7);
    assert!(matches!(
        next_event(&harness.events),
        UiEvent::TaskFailed { task: "choose", .. }
    ));
}

#[test]
fn model_change_applies_to_the_next_send() {
    let harness = harness();

    harness.controller.set_model(Model::Pro25);
    assert_eq!(next_event(&harness.events), UiEvent::ModelChanged(Model::Pro25));
    assert_eq!(harness.controller.session().model(), Model::Pro25);

    send_and_wait(&harness, "hi");
    let requests = harness.backend.requests();
    let RpcBatch::Generate(request) = &requests[0] else {
        panic!("expected a generate request");
    };
    assert_eq!(request.model, Model::Pro25);
}
