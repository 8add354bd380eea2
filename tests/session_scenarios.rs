use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chat_provider::{cancel_signal, ChatBackend, ChatError, ContinuationTokens, Model, RpcBatch};
use chat_provider_mock::{EnvelopeBuilder, ScriptedBackend, ScriptedReply};
use gem_chat::{AttachmentManager, Session, TurnRequest};
use history_store::{HistoryStore, NewMessage, Role};
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

struct Fixture {
    _dir: TempDir,
    store: Arc<HistoryStore>,
}

fn fixture() -> Fixture {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(HistoryStore::open(&dir.path().join("history")).expect("open store"));
    Fixture { _dir: dir, store }
}

fn as_backend(backend: &Arc<ScriptedBackend>) -> Arc<dyn ChatBackend> {
    Arc::clone(backend) as Arc<dyn ChatBackend>
}

fn sent_tokens(batch: &RpcBatch) -> ContinuationTokens {
    match batch {
        RpcBatch::Generate(request) => request.tokens.clone(),
        RpcBatch::Execute(_) => panic!("expected a generate request"),
    }
}

/// Stored conversation with one completed exchange and tokens (C1, R1, RC1).
fn preload(store: &HistoryStore) -> String {
    let conversation = store.create(Model::Flash25).expect("create");
    store
        .append_message(&conversation.id, NewMessage::user("hello there"))
        .expect("user");
    store
        .append_message(&conversation.id, NewMessage::assistant("hi!"))
        .expect("assistant");
    store
        .update_tokens(&conversation.id, &ContinuationTokens::new("C1", "R1", "RC1"))
        .expect("tokens");
    conversation.id
}

#[test]
fn fresh_conversation_is_created_and_titled() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::text(
        "C1", "R1", "RC1", "hello",
    )]));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );

    let output = session.send(TurnRequest::new("hi")).expect("send");
    assert_eq!(output.text(), "hello");

    let summaries = fixture.store.list();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].title, "hi");

    let stored = fixture.store.get(&summaries[0].id).expect("get");
    let turns: Vec<_> = stored
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect();
    assert_eq!(turns, vec![(Role::User, "hi"), (Role::Assistant, "hello")]);
    assert_eq!(stored.tokens, ContinuationTokens::new("C1", "R1", "RC1"));
    assert_eq!(stored.messages[1].candidate_index, Some(0));
    assert_eq!(session.conversation_id(), Some(stored.id));
}

#[test]
fn resumed_session_continues_the_thread() {
    let fixture = fixture();
    let id = preload(&fixture.store);
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::text(
        "C1", "R2", "RC2", "sure",
    )]));
    let conversation = fixture.store.get(&id).expect("get");
    let session = Session::restore(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        &conversation,
    );
    assert_eq!(session.model(), Model::Flash25);

    session.send(TurnRequest::new("more")).expect("send");

    assert_eq!(
        sent_tokens(&backend.requests()[0]),
        ContinuationTokens::new("C1", "R1", "RC1")
    );
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.tokens, ContinuationTokens::new("C1", "R2", "RC2"));
    assert_eq!(stored.messages.len(), 4);
    assert_eq!(stored.title, "hello there");
}

#[test]
fn restored_metadata_reproduces_outgoing_tokens() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::text("C9", "R9", "RC9", "first"),
        ScriptedReply::text("", "R10", "RC10", "second"),
        ScriptedReply::text("", "R10", "RC10", "second again"),
    ]));
    let original = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );
    original.send(TurnRequest::new("one")).expect("first send");
    original.send(TurnRequest::new("two")).expect("second send");
    let id = original.conversation_id().expect("conversation created");

    let conversation = fixture.store.get(&id).expect("get");
    let unbound = Session::new(as_backend(&backend), conversation.model);
    unbound
        .set_metadata(conversation.tokens.clone())
        .expect("restore tokens");
    unbound.send(TurnRequest::new("three")).expect("third send");

    let requests = backend.requests();
    assert_eq!(sent_tokens(&requests[2]), original.metadata());
    assert_eq!(sent_tokens(&requests[2]), ContinuationTokens::new("C9", "R10", "RC10"));
}

#[test]
fn parse_failure_keeps_user_turn_and_tokens() {
    let fixture = fixture();
    let id = preload(&fixture.store);
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::malformed()]));
    let conversation = fixture.store.get(&id).expect("get");
    let session = Session::restore(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        &conversation,
    );

    let error = session.send(TurnRequest::new("x")).expect_err("malformed reply");
    assert!(matches!(error, ChatError::Parse(_)));

    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages.len(), 3);
    let last = stored.messages.last().expect("last message");
    assert_eq!((last.role, last.content.as_str()), (Role::User, "x"));
    assert_eq!(stored.tokens, ContinuationTokens::new("C1", "R1", "RC1"));
    assert_eq!(session.metadata(), ContinuationTokens::new("C1", "R1", "RC1"));
}

#[test]
fn next_turn_after_failure_orphans_the_unanswered_prompt() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::Fail(ChatError::RateLimited { retry_hint: None }),
        ScriptedReply::text("C1", "R1", "RC1", "answer"),
    ]));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );

    assert!(matches!(
        session.send(TurnRequest::new("first try")),
        Err(ChatError::RateLimited { .. })
    ));
    session.send(TurnRequest::new("second try")).expect("retry");

    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    let flags: Vec<_> = stored
        .messages
        .iter()
        .map(|message| (message.content.as_str(), message.orphaned))
        .collect();
    assert_eq!(
        flags,
        vec![("first try", true), ("second try", false), ("answer", false)]
    );
    assert_eq!(stored.title, "first try");
}

#[test]
fn auth_refresh_retries_once_and_persists_one_exchange() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::Fail(ChatError::AuthRequired),
        ScriptedReply::text("C1", "R1", "RC1", "welcome back"),
    ]));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );

    session.send(TurnRequest::new("hi")).expect("send after refresh");

    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(backend.request_count(), 2);
    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.tokens, ContinuationTokens::new("C1", "R1", "RC1"));
}

#[test]
fn attachment_handles_are_not_retained_by_the_manager() {
    let fixture = fixture();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("diagram.png");
    fs::write(&path, [0x89, b'P', b'N', b'G']).expect("write");

    let backend = Arc::new(ScriptedBackend::echo());
    let manager = AttachmentManager::new(as_backend(&backend));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );

    let handle = manager.upload(&path).expect("upload");
    session
        .send(TurnRequest::new("look").with_attachments(vec![handle.clone()]))
        .expect("first send");
    session
        .send(TurnRequest::new("again").with_attachments(vec![handle.clone()]))
        .expect("reuse is the caller's choice");

    assert_eq!(backend.uploads().len(), 1);
    for batch in backend.requests() {
        let RpcBatch::Generate(request) = batch else {
            panic!("expected a generate request");
        };
        assert_eq!(request.attachments, vec![handle.clone()]);
    }

    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages[0].attachments, vec!["diagram.png".to_owned()]);
}

#[test]
fn concurrent_send_is_rejected_while_first_completes() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::text(
        "C1", "R1", "RC1", "done",
    )]));
    backend.close_gate();
    let session = Arc::new(Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    ));

    let worker = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.send(TurnRequest::new("first")))
    };
    assert!(backend.wait_for_requests(1, Duration::from_secs(5)));

    assert_eq!(session.send(TurnRequest::new("second")), Err(ChatError::Busy));

    backend.open_gate();
    let output = worker.join().expect("worker joins").expect("first send");
    assert_eq!(output.text(), "done");

    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].content, "first");
}

#[test]
fn cancelled_send_keeps_user_turn_only() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::echo());
    backend.close_gate();
    let session = Arc::new(Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    ));
    let cancel = cancel_signal();

    let worker = {
        let session = Arc::clone(&session);
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || session.send(TurnRequest::new("never mind").with_cancel(cancel)))
    };
    assert!(backend.wait_for_requests(1, Duration::from_secs(5)));
    cancel.store(true, Ordering::Release);

    assert_eq!(worker.join().expect("joins"), Err(ChatError::Cancelled));
    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].role, Role::User);
    assert!(stored.tokens.is_new());
}

#[test]
fn candidate_choice_is_persisted_with_tokens() {
    let fixture = fixture();
    let frames = EnvelopeBuilder::new("C1", "R1")
        .reply("RC-a", "short answer")
        .reply("RC-b", "long answer")
        .frames();
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::Frames(frames)]));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );
    session.send(TurnRequest::new("explain")).expect("send");

    let chosen = session.choose_candidate(1).expect("choose");
    assert_eq!(chosen.text, "long answer");

    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[1].content, "long answer");
    assert_eq!(stored.messages[1].candidate_index, Some(1));
    assert_eq!(stored.tokens, ContinuationTokens::new("C1", "R1", "RC-b"));
}

#[test]
fn choosing_after_a_failed_send_leaves_session_and_store_in_step() {
    let fixture = fixture();
    let frames = EnvelopeBuilder::new("C", "R")
        .reply("RC-a", "first")
        .reply("RC-b", "second")
        .frames();
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::Frames(frames),
        ScriptedReply::malformed(),
    ]));
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );
    session.send(TurnRequest::new("q1")).expect("first send");
    assert!(matches!(
        session.send(TurnRequest::new("q2")),
        Err(ChatError::Parse(_))
    ));

    assert!(matches!(session.choose_candidate(1), Err(ChatError::Storage(_))));

    let id = session.conversation_id().expect("id");
    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.tokens, ContinuationTokens::new("C", "R", "RC-a"));
    assert_eq!(session.metadata(), stored.tokens);
    assert_eq!(session.last_output().map(|output| output.chosen()), Some(0));

    let restored = Session::restore(as_backend(&backend), Arc::clone(&fixture.store), &stored);
    assert_eq!(restored.metadata(), session.metadata());
}

#[test]
fn model_and_gem_changes_are_persisted() {
    let fixture = fixture();
    let backend = Arc::new(ScriptedBackend::echo());
    let session = Session::with_history(
        as_backend(&backend),
        Arc::clone(&fixture.store),
        Model::Unspecified,
    );
    session.set_gem(Some("gem-1".to_owned())).expect("gem before first send");
    session.send(TurnRequest::new("hi")).expect("send");
    let id = session.conversation_id().expect("id");
    assert_eq!(fixture.store.get(&id).expect("get").gem_id.as_deref(), Some("gem-1"));

    let tokens_before = session.metadata();
    session.set_model(Model::Pro30).expect("model");
    session.set_gem(None).expect("clear gem");

    let stored = fixture.store.get(&id).expect("get");
    assert_eq!(stored.model, Model::Pro30);
    assert_eq!(stored.gem_id, None);
    assert_eq!(session.metadata(), tokens_before);
}
