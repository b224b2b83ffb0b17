mod common;

use chat_orchestrator::chat::ServerEvent;
use chat_orchestrator::context::{Role, DEFAULT_TITLE};
use chat_orchestrator::store::ConversationStore;
use chat_orchestrator::Error;
use common::{drain, kinds, session, Harness, HarnessOptions, StreamScript};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_duplex_turn_event_order() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);
    harness.chat.push_stream(StreamScript::Chunks(vec!["Hel", "lo"]));

    harness
        .orchestrator
        .run_turn(&session, "hi there", &CancellationToken::new())
        .await;

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec!["user_message", "assistant_chunk", "assistant_chunk", "assistant_complete"]
    );
    match (&events[0], &events[3]) {
        (ServerEvent::UserMessage { message: user }, ServerEvent::AssistantComplete { message: reply }) => {
            assert_eq!(user.content, "hi there");
            assert_eq!(user.role, Role::User);
            assert_eq!(reply.content, "Hello");
            assert_eq!(reply.role, Role::Assistant);
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let turns = harness.turns(conversation.id).await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Hello");
}

#[tokio::test]
async fn test_stream_failure_after_chunks_persists_nothing() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);
    harness
        .chat
        .push_stream(StreamScript::FailAfter(vec!["a", "b", "c"]));

    harness
        .orchestrator
        .run_turn(&session, "hello", &CancellationToken::new())
        .await;

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            "user_message",
            "assistant_chunk",
            "assistant_chunk",
            "assistant_chunk",
            "error"
        ]
    );
    assert_eq!(events[4], ServerEvent::error("Failed to get AI response"));

    let turns = harness.turns(conversation.id).await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
}

#[tokio::test]
async fn test_request_turn_failure_returns_error_without_reply() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    harness
        .chat
        .push_stream(StreamScript::FailAfter(vec!["a", "b", "c"]));

    let result = harness
        .orchestrator
        .send_message(1, conversation.id, "hello")
        .await;

    assert!(matches!(result, Err(Error::Llm(_))));
    let turns = harness.turns(conversation.id).await;
    assert!(turns.iter().all(|t| t.role == Role::User));
}

#[tokio::test]
async fn test_unreachable_backend_reports_one_error() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);
    harness.chat.push_stream(StreamScript::Refuse);

    harness
        .orchestrator
        .run_turn(&session, "hello", &CancellationToken::new())
        .await;

    assert_eq!(kinds(&drain(&mut rx)), vec!["user_message", "error"]);
}

#[tokio::test]
async fn test_empty_reply_is_an_error() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    harness.chat.push_stream(StreamScript::Chunks(vec!["", "  "]));

    let result = harness
        .orchestrator
        .send_message(1, conversation.id, "hello")
        .await;

    assert!(matches!(result, Err(Error::Llm(_))));
    assert_eq!(harness.turns(conversation.id).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_mid_stream_discards_partial_reply() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);
    harness
        .chat
        .push_stream(StreamScript::HangAfter(vec!["partial"]));

    let cancel = CancellationToken::new();
    let turn = {
        let orchestrator = harness.orchestrator.clone();
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run_turn(&session, "hello", &cancel).await })
    };

    // Wait until the first chunk went out, then drop the client
    loop {
        match rx.recv().await {
            Some(ServerEvent::AssistantChunk { .. }) => break,
            Some(_) => continue,
            None => panic!("session closed early"),
        }
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), turn)
        .await
        .expect("turn did not stop")
        .unwrap();

    assert!(drain(&mut rx).is_empty(), "no error or completion after cancel");
    let turns = harness.turns(conversation.id).await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
}

#[tokio::test]
async fn test_closed_session_abandons_turn() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, rx) = session(conversation.id, 1);
    drop(rx);

    harness
        .orchestrator
        .run_turn(&session, "hello", &CancellationToken::new())
        .await;

    let turns = harness.turns(conversation.id).await;
    assert_eq!(turns.len(), 1);
}

#[tokio::test]
async fn test_silent_stream_times_out() {
    let harness = Harness::with_options(HarnessOptions {
        idle_timeout: Duration::from_millis(100),
        ..HarnessOptions::default()
    });
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);
    harness
        .chat
        .push_stream(StreamScript::HangAfter(vec!["partial"]));
    harness.chat.push_stream(StreamScript::HangAfter(vec![]));

    harness
        .orchestrator
        .run_turn(&session, "hello", &CancellationToken::new())
        .await;
    assert_eq!(
        kinds(&drain(&mut rx)),
        vec!["user_message", "assistant_chunk", "error"]
    );

    let result = harness
        .orchestrator
        .send_message(1, conversation.id, "again")
        .await;
    assert!(matches!(result, Err(Error::StreamTimeout(_))));
    assert!(harness
        .turns(conversation.id)
        .await
        .iter()
        .all(|t| t.role == Role::User));
}

#[tokio::test]
async fn test_blank_input() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (session, mut rx) = session(conversation.id, 1);

    harness
        .orchestrator
        .run_turn(&session, "   \n", &CancellationToken::new())
        .await;
    assert!(drain(&mut rx).is_empty());

    let result = harness.orchestrator.send_message(1, conversation.id, "  ").await;
    assert!(matches!(result, Err(Error::EmptyMessage)));
    assert_eq!(harness.store.writes(), 0);
}

#[tokio::test]
async fn test_foreign_conversation_is_not_touched() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    harness.seed(conversation.id, &["mine", "yours"]).await;
    let writes = harness.store.writes();

    let result = harness.orchestrator.send_message(2, conversation.id, "hi").await;
    assert!(matches!(result, Err(Error::ConversationNotFound(id)) if id == conversation.id));

    let result = harness.orchestrator.list_messages(2, conversation.id).await;
    assert!(matches!(result, Err(Error::ConversationNotFound(_))));

    assert_eq!(harness.store.reads(), 0);
    assert_eq!(harness.store.writes(), writes);
    assert!(harness.chat.last_stream_request().is_none());
}

#[tokio::test]
async fn test_first_message_titles_conversation_once() {
    let harness = Harness::new();
    let conversation = harness
        .orchestrator
        .create_conversation(1, None)
        .await
        .unwrap();
    assert_eq!(conversation.title, DEFAULT_TITLE);
    harness.summary.push_completion("\"Trip planning\"");

    harness
        .orchestrator
        .send_message(1, conversation.id, "help me plan a trip")
        .await
        .unwrap();

    let mut title = String::new();
    for _ in 0..50 {
        title = harness
            .store
            .get_conversation(conversation.id)
            .await
            .unwrap()
            .unwrap()
            .title;
        if title != DEFAULT_TITLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(title, "Trip planning");

    harness
        .orchestrator
        .send_message(1, conversation.id, "and book hotels")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.summary.completion_calls(), 1);
}

#[tokio::test]
async fn test_title_failure_does_not_fail_turn() {
    let harness = Harness::new();
    let conversation = harness
        .orchestrator
        .create_conversation(1, Some("  "))
        .await
        .unwrap();
    harness.summary.push_completion_error();

    let exchange = harness
        .orchestrator
        .send_message(1, conversation.id, "hello")
        .await
        .unwrap();
    assert_eq!(exchange.assistant_message.content, "Hello there");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = harness.store.get_conversation(conversation.id).await.unwrap().unwrap();
    assert_eq!(stored.title, DEFAULT_TITLE);
}

#[tokio::test]
async fn test_concurrent_turns_on_one_conversation_do_not_interleave() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    for _ in 0..2 {
        harness.chat.push_stream(StreamScript::Slow(
            vec!["slow", " reply"],
            Duration::from_millis(30),
        ));
    }

    let (first, second) = tokio::join!(
        harness.orchestrator.send_message(1, conversation.id, "first"),
        harness.orchestrator.send_message(1, conversation.id, "second"),
    );
    first.unwrap();
    second.unwrap();

    let roles: Vec<Role> = harness
        .turns(conversation.id)
        .await
        .iter()
        .map(|t| t.role)
        .collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );

    // The second turn's window already contained the first exchange
    let requests = harness.chat.stream_requests.lock().unwrap();
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[1].messages.len(), 3);
}

#[tokio::test]
async fn test_other_sessions_see_persisted_turns_only() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    let (origin, mut origin_rx) = session(conversation.id, 1);
    let (watcher, mut watcher_rx) = session(conversation.id, 1);
    let _origin_registration = harness.orchestrator.registry().attach(&origin);
    let _watcher_registration = harness.orchestrator.registry().attach(&watcher);

    harness
        .orchestrator
        .run_turn(&origin, "hello", &CancellationToken::new())
        .await;

    assert_eq!(
        kinds(&drain(&mut origin_rx)),
        vec!["user_message", "assistant_chunk", "assistant_chunk", "assistant_complete"]
    );
    assert_eq!(
        kinds(&drain(&mut watcher_rx)),
        vec!["user_message", "assistant_complete"]
    );

    harness
        .orchestrator
        .send_message(1, conversation.id, "from rest")
        .await
        .unwrap();
    assert_eq!(
        kinds(&drain(&mut watcher_rx)),
        vec!["user_message", "assistant_complete"]
    );
}

#[tokio::test]
async fn test_digest_stores_summary_and_tags() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;
    harness
        .seed(conversation.id, &["how do I use tokio", "spawn tasks"])
        .await;
    harness.summary.push_completion("Talked about tokio");
    harness.summary.push_completion("rust, tokio，async");

    let digested = harness
        .orchestrator
        .digest(1, conversation.id, true)
        .await
        .unwrap();

    assert_eq!(digested.summary.as_deref(), Some("Talked about tokio"));
    assert_eq!(digested.tags, vec!["rust", "tokio", "async"]);
    // Digest never touches the compression summary or the turns
    assert!(digested.stored_summary().is_none());
    assert_eq!(harness.turns(conversation.id).await.len(), 2);
}

#[tokio::test]
async fn test_digest_of_empty_conversation_is_a_no_op() {
    let harness = Harness::new();
    let conversation = harness.conversation(1).await;

    let digested = harness
        .orchestrator
        .digest(1, conversation.id, true)
        .await
        .unwrap();

    assert!(digested.summary.is_none());
    assert_eq!(harness.summary.completion_calls(), 0);
}
