//! Drives `sync_chat` against a local websocket server.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use voicejournal::chat::integrity::hash_items;
use voicejournal::chat::state::JournalEntryItem;
use voicejournal::chat::{sync_chat, ChatSyncConfig, ChatSyncError, JournalChatState};
use voicejournal::clock::ServerClock;
use voicejournal::crypto::{Fernet, WrappedClientKey};
use voicejournal::settings::ChatSettings;

/// What the server does on one connection after reading `authorize`.
#[derive(Clone)]
enum Script {
    Reject,
    /// Accepts, then hangs up without sending anything.
    Drop,
    Send(Vec<Value>),
}

fn key() -> WrappedClientKey {
    WrappedClientKey {
        uid: "ck".into(),
        key: Fernet::new(&Fernet::generate_key()).unwrap(),
    }
}

fn item(author: &str, text: &str) -> Value {
    json!({
        "type": "chat",
        "display_author": author,
        "data": {"type": "textual", "parts": [{"type": "paragraph", "value": text}]},
    })
}

fn integrity_of(items: &[Value]) -> String {
    let items: Vec<JournalEntryItem> = serde_json::from_value(Value::Array(items.to_vec())).unwrap();
    hash_items(&items)
}

fn segment(key: &WrappedClientKey, clock: &ServerClock, mutations: Value, more: bool) -> Value {
    let token = key
        .key
        .encrypt(json!({"mutations": mutations}).to_string().as_bytes(), clock.now_ms());
    json!({"type": "chat", "encrypted_segment_data": token, "more": more})
}

fn batch(events: Vec<Value>) -> Value {
    json!({"success": true, "type": "event_batch", "data": {"events": events}})
}

/// Serves one script per accepted connection, in order. Returns the config
/// pointing at it and a counter of `authorize` messages seen.
async fn serve(scripts: Vec<Script>) -> (ChatSyncConfig, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let authorizations = Arc::new(AtomicUsize::new(0));
    let seen = authorizations.clone();
    tokio::spawn(async move {
        for script in scripts {
            let Ok((stream, _)) = listener.accept().await else { return };
            let mut ws = accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else { continue };
            let authorize: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(authorize["type"], "authorize");
            assert_eq!(authorize["data"]["jwt"], "entry-jwt");
            seen.fetch_add(1, Ordering::SeqCst);
            match script {
                Script::Reject => {
                    let reply = json!({"success": false, "type": "auth_response"});
                    let _ = ws.send(Message::Text(reply.to_string().into())).await;
                }
                Script::Drop => {
                    let reply = json!({"success": true, "type": "auth_response"});
                    let _ = ws.send(Message::Text(reply.to_string().into())).await;
                    let _ = ws.close(None).await;
                }
                Script::Send(messages) => {
                    let reply = json!({"success": true, "type": "auth_response"});
                    let _ = ws.send(Message::Text(reply.to_string().into())).await;
                    for message in messages {
                        let _ = ws.send(Message::Text(message.to_string().into())).await;
                    }
                    // Hold the socket until the client hangs up.
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
        }
    });
    let config = ChatSyncConfig {
        ws_base_url: format!("ws://{}", addr),
        chat: ChatSettings {
            backoff_base_ms: 1,
            ..ChatSettings::default()
        },
    };
    (config, authorizations)
}

async fn run(
    config: &ChatSyncConfig,
    key: &WrappedClientKey,
    clock: &ServerClock,
) -> (Result<JournalChatState, ChatSyncError>, Vec<JournalChatState>) {
    let mut published = Vec::new();
    let result = sync_chat(
        config,
        key,
        clock,
        "entry-jwt",
        "entry-1",
        &CancellationToken::new(),
        |state| published.push(state),
    )
    .await;
    (result, published)
}

#[tokio::test]
async fn streams_segments_until_the_last_one() {
    let key = key();
    let clock = ServerClock::new();
    let first = item("self", "Today was long");
    let second = item("other", "Tell me more");
    let messages = vec![
        batch(vec![json!({"type": "thinking-spinner", "message": "Thinking", "detail": null})]),
        batch(vec![segment(
            &key,
            &clock,
            json!([
                {"key": ["data", 0], "value": first.clone()},
                {"key": ["integrity"], "value": integrity_of(&[first.clone()])},
            ]),
            true,
        )]),
        batch(vec![segment(
            &key,
            &clock,
            json!([
                {"key": ["data", 1], "value": second.clone()},
                {"key": ["integrity"], "value": integrity_of(&[first.clone(), second.clone()])},
            ]),
            false,
        )]),
    ];
    let (config, authorizations) = serve(vec![Script::Send(messages)]).await;

    let (result, published) = run(&config, &key, &clock).await;
    let state = result.unwrap();
    assert_eq!(state.uid, "entry-1");
    assert_eq!(state.data.len(), 2);
    assert_eq!(state.integrity, hash_items(&state.data));
    assert_eq!(state.transient, None);
    assert_eq!(authorizations.load(Ordering::SeqCst), 1);

    // Initial empty document, then one per batch.
    assert_eq!(published.len(), 4);
    assert!(published[0].data.is_empty());
    assert!(published[1].transient.is_some());
    assert_eq!(published[2].data.len(), 1);
    assert_eq!(published.last(), Some(&state));
}

#[tokio::test]
async fn rejected_authorization_is_fatal() {
    let key = key();
    let clock = ServerClock::new();
    let (config, authorizations) = serve(vec![Script::Reject, Script::Reject]).await;

    let (result, published) = run(&config, &key, &clock).await;
    assert!(matches!(result, Err(ChatSyncError::AuthorizationRejected)));
    assert_eq!(authorizations.load(Ordering::SeqCst), 1);
    assert_eq!(published.len(), 1);
}

#[tokio::test]
async fn reconnects_after_the_server_hangs_up() {
    let key = key();
    let clock = ServerClock::new();
    let only = item("self", "Hello");
    let messages = vec![batch(vec![segment(
        &key,
        &clock,
        json!([
            {"key": ["data", 0], "value": only.clone()},
            {"key": ["integrity"], "value": integrity_of(&[only.clone()])},
        ]),
        false,
    )])];
    let (config, authorizations) = serve(vec![Script::Drop, Script::Send(messages)]).await;

    let (result, published) = run(&config, &key, &clock).await;
    let state = result.unwrap();
    assert_eq!(state.data.len(), 1);
    assert_eq!(authorizations.load(Ordering::SeqCst), 2);
    // The empty document is only published once across attempts.
    assert_eq!(published.iter().filter(|s| s.data.is_empty()).count(), 1);
}

#[tokio::test]
async fn integrity_mismatch_stops_the_sync() {
    let key = key();
    let clock = ServerClock::new();
    let messages = vec![batch(vec![segment(
        &key,
        &clock,
        json!([
            {"key": ["data", 0], "value": item("self", "Hello")},
            {"key": ["integrity"], "value": "not-the-hash"},
        ]),
        false,
    )])];
    let (config, _) = serve(vec![Script::Send(messages)]).await;

    let (result, published) = run(&config, &key, &clock).await;
    match result {
        Err(ChatSyncError::IntegrityMismatch { received, .. }) => assert_eq!(received, "not-the-hash"),
        other => panic!("expected integrity mismatch, got {:?}", other),
    }
    assert_eq!(published.len(), 1);
}

#[tokio::test]
async fn gives_up_once_the_retry_budget_is_spent() {
    let key = key();
    let clock = ServerClock::new();
    let (mut config, authorizations) = serve(vec![Script::Drop; 8]).await;
    config.chat.max_retries_in_window = 3;

    let (result, _) = run(&config, &key, &clock).await;
    assert!(matches!(result, Err(ChatSyncError::TooManyRetries)));
    assert_eq!(authorizations.load(Ordering::SeqCst), 3);
}
