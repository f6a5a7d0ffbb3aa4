//! Reads a journal chat over `WS /api/2/journals/chat` until the server says
//! no more data is coming, reconnecting on connection-level trouble.

use super::integrity::hash_items;
use super::mutations::{apply_mutation, Mutation, MutationKey, SegmentData};
use super::state::JournalChatState;
use crate::clock::ServerClock;
use crate::crypto::{CryptoError, WrappedClientKey};
use crate::settings::{ChatSettings, Settings};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;

const CHAT_PATH: &str = "/api/2/journals/chat";

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<Ws, tungstenite::Message>;
type WsStream = futures_util::stream::SplitStream<Ws>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatSyncError {
    #[error("canceled")]
    Canceled,
    #[error("too many retries")]
    TooManyRetries,
    #[error("authorization rejected")]
    AuthorizationRejected,
    #[error("server error: {0}")]
    ServerError(Value),
    #[error("integrity mismatch: expected {expected}, got {received}")]
    IntegrityMismatch { expected: String, received: String },
    #[error("failed to decrypt segment: {0}")]
    Decrypt(CryptoError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("client key unavailable: {0}")]
    Key(String),
}

impl ChatSyncError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ChatSyncError::Canceled)
    }
}

/// How a single connection attempt ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    FailedRetryable,
}

#[derive(Debug, Clone)]
pub struct ChatSyncConfig {
    pub ws_base_url: String,
    pub chat: ChatSettings,
}

impl ChatSyncConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ws_base_url: settings.ws_base_url.trim_end_matches('/').to_string(),
            chat: settings.chat.clone(),
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}{}", self.ws_base_url, CHAT_PATH)
    }
}

/// Failures remembered over a sliding window. Once the window holds
/// `max_in_window` failures the caller should stop reconnecting.
#[derive(Debug)]
pub struct RetryBudget {
    window: Duration,
    max_in_window: usize,
    base_ms: u64,
    recent: VecDeque<Instant>,
}

impl RetryBudget {
    pub fn new(window: Duration, max_in_window: usize, base_ms: u64) -> Self {
        Self {
            window,
            max_in_window,
            base_ms,
            recent: VecDeque::new(),
        }
    }

    pub fn from_settings(chat: &ChatSettings) -> Self {
        Self::new(
            Duration::from_secs(chat.retry_window_secs),
            chat.max_retries_in_window,
            chat.backoff_base_ms,
        )
    }

    /// Records a failure at `now`. Returns how long to back off before the
    /// next attempt, or `None` once the budget is spent.
    pub fn record_failure(&mut self, now: Instant) -> Option<Duration> {
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);
        let n = self.recent.len();
        if n >= self.max_in_window {
            return None;
        }
        let factor = 1u64 << n.min(16);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..2.0);
        let ms = (self.base_ms.saturating_mul(factor) as f64 * jitter) as u64;
        Some(Duration::from_millis(ms))
    }

    pub fn failures_in_window(&self) -> usize {
        self.recent.len()
    }
}

fn build_ws_request(url: &str) -> Result<tungstenite::http::Request<()>, String> {
    url.into_client_request()
        .map_err(|e| format!("Failed to build request: {}", e))
}

/// Syncs one journal chat to completion.
///
/// `publish` receives the document once up front (empty, with its integrity
/// filled in) and again after every event batch that verified. The working
/// document survives reconnects; only the first attempt starts from empty.
/// Resolves with the final document.
pub async fn sync_chat<P>(
    config: &ChatSyncConfig,
    key: &WrappedClientKey,
    clock: &ServerClock,
    journal_chat_jwt: &str,
    journal_entry_uid: &str,
    cancel: &CancellationToken,
    mut publish: P,
) -> Result<JournalChatState, ChatSyncError>
where
    P: FnMut(JournalChatState) + Send,
{
    if cancel.is_cancelled() {
        return Err(ChatSyncError::Canceled);
    }
    let initial = JournalChatState::empty(journal_entry_uid);
    let mut doc = serde_json::to_value(&initial)
        .map_err(|e| ChatSyncError::Protocol(format!("Failed to encode initial state: {}", e)))?;
    publish(initial);

    let mut budget = RetryBudget::from_settings(&config.chat);
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if attempts > 1 {
            log::info!("[chat] reconnecting {} (attempt {})", journal_entry_uid, attempts);
        }
        let outcome =
            sync_once(config, key, clock, journal_chat_jwt, &mut doc, &mut publish, cancel).await?;
        if outcome == SyncOutcome::Success {
            log::info!("[chat] {} complete", journal_entry_uid);
            return serde_json::from_value(doc)
                .map_err(|e| ChatSyncError::Protocol(format!("Failed to parse chat state: {}", e)));
        }

        let Some(delay) = budget.record_failure(Instant::now()) else {
            log::warn!(
                "[chat] {} giving up after {} failures in window",
                journal_entry_uid,
                budget.failures_in_window()
            );
            return Err(ChatSyncError::TooManyRetries);
        };
        log::debug!("[chat] backing off {}ms", delay.as_millis());
        tokio::select! {
            _ = cancel.cancelled() => return Err(ChatSyncError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

enum Incoming {
    Message(Value),
    TimedOut,
    Closed,
}

async fn next_message(
    ws_rx: &mut WsStream,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Incoming, ChatSyncError> {
    let deadline = Instant::now() + timeout;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatSyncError::Canceled),
            r = tokio::time::timeout_at(deadline, ws_rx.next()) => r,
        };
        let msg = match next {
            Err(_) => return Ok(Incoming::TimedOut),
            Ok(None) => return Ok(Incoming::Closed),
            Ok(Some(Err(e))) => {
                log::warn!("[chat] websocket error: {}", e);
                return Ok(Incoming::Closed);
            }
            Ok(Some(Ok(m))) => m,
        };
        let text = match msg {
            tungstenite::Message::Text(t) => t,
            tungstenite::Message::Close(frame) => {
                if let Some(frame) = frame {
                    log::info!("[chat] websocket closed: {} {}", frame.code, frame.reason);
                }
                return Ok(Incoming::Closed);
            }
            _ => continue,
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(v) => return Ok(Incoming::Message(v)),
            Err(e) => {
                log::warn!("[chat] unparseable frame: {}", e);
                return Ok(Incoming::Closed);
            }
        }
    }
}

async fn sync_once<P>(
    config: &ChatSyncConfig,
    key: &WrappedClientKey,
    clock: &ServerClock,
    journal_chat_jwt: &str,
    doc: &mut Value,
    publish: &mut P,
    cancel: &CancellationToken,
) -> Result<SyncOutcome, ChatSyncError>
where
    P: FnMut(JournalChatState) + Send,
{
    let request = build_ws_request(&config.chat_url()).map_err(ChatSyncError::Protocol)?;
    let connected = tokio::select! {
        _ = cancel.cancelled() => return Err(ChatSyncError::Canceled),
        r = tokio::time::timeout(config.chat.open_timeout(), connect_async(request)) => r,
    };
    let ws_stream = match connected {
        Err(_) => {
            log::warn!("[chat] websocket did not open in time");
            return Ok(SyncOutcome::FailedRetryable);
        }
        Ok(Err(e)) => {
            log::warn!("[chat] websocket did not open: {}", e);
            return Ok(SyncOutcome::FailedRetryable);
        }
        Ok(Ok((stream, _))) => stream,
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let result = run_connection(
        config,
        key,
        clock,
        journal_chat_jwt,
        doc,
        publish,
        cancel,
        &mut ws_tx,
        &mut ws_rx,
    )
    .await;
    let _ = ws_tx.close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<P>(
    config: &ChatSyncConfig,
    key: &WrappedClientKey,
    clock: &ServerClock,
    journal_chat_jwt: &str,
    doc: &mut Value,
    publish: &mut P,
    cancel: &CancellationToken,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> Result<SyncOutcome, ChatSyncError>
where
    P: FnMut(JournalChatState) + Send,
{
    let authorize = json!({"type": "authorize", "data": {"jwt": journal_chat_jwt}});
    if let Err(e) = ws_tx
        .send(tungstenite::Message::Text(authorize.to_string().into()))
        .await
    {
        log::warn!("[chat] failed to send authorize: {}", e);
        return Ok(SyncOutcome::FailedRetryable);
    }

    let auth = match next_message(ws_rx, config.chat.auth_timeout(), cancel).await? {
        Incoming::Message(v) => v,
        Incoming::TimedOut => {
            log::warn!("[chat] no authorization response");
            return Ok(SyncOutcome::FailedRetryable);
        }
        Incoming::Closed => return Ok(SyncOutcome::FailedRetryable),
    };
    if !auth.get("success").and_then(Value::as_bool).unwrap_or(false) {
        log::warn!("[chat] authorization rejected on chat websocket");
        return Err(ChatSyncError::AuthorizationRejected);
    }

    loop {
        let message = match next_message(ws_rx, config.chat.read_timeout(), cancel).await? {
            Incoming::Message(v) => v,
            Incoming::TimedOut => {
                log::warn!("[chat] read timed out");
                return Ok(SyncOutcome::FailedRetryable);
            }
            Incoming::Closed => return Ok(SyncOutcome::FailedRetryable),
        };
        let message: ServerMessage = match serde_json::from_value(message) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("[chat] malformed message: {}", e);
                return Ok(SyncOutcome::FailedRetryable);
            }
        };
        if !message.success {
            log::info!("[chat] unexpected top-level error; treating as retryable");
            return Ok(SyncOutcome::FailedRetryable);
        }
        if message.kind.as_deref() != Some("event_batch") {
            log::warn!("[chat] ignoring unexpected message type {:?}", message.kind);
            continue;
        }
        let events = message
            .data
            .and_then(|d| serde_json::from_value::<EventBatch>(d).ok())
            .map(|b| b.events)
            .unwrap_or_default();
        let seen_end = apply_events(doc, events, key, clock)?;

        let state: JournalChatState = serde_json::from_value(doc.clone())
            .map_err(|e| ChatSyncError::Protocol(format!("Failed to parse chat state: {}", e)))?;
        let expected = hash_items(&state.data);
        if state.integrity != expected {
            log::warn!(
                "[chat] integrity mismatch after parsing events! expected {} got {}",
                expected,
                state.integrity
            );
            return Err(ChatSyncError::IntegrityMismatch {
                expected,
                received: state.integrity,
            });
        }
        publish(state);

        if seen_end {
            return Ok(SyncOutcome::Success);
        }
    }
}

#[derive(Deserialize)]
struct ServerMessage {
    #[serde(default)]
    success: bool,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct EventBatch {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Deserialize)]
struct ChatEvent {
    encrypted_segment_data: String,
    #[serde(default)]
    more: bool,
}

fn set_transient(doc: &mut Value, value: Value) {
    // A single key step has no index to reject.
    if let Err(e) = apply_mutation(
        doc,
        Mutation {
            key: vec![MutationKey::Key("transient".into())],
            value,
        },
    ) {
        log::warn!("[chat] failed to set transient state: {}", e);
    }
}

/// Applies one batch of events to `doc`. Returns whether the batch carried the
/// final chat segment.
fn apply_events(
    doc: &mut Value,
    events: Vec<Value>,
    key: &WrappedClientKey,
    clock: &ServerClock,
) -> Result<bool, ChatSyncError> {
    let mut seen_end = false;
    for event in events {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        match kind.as_str() {
            "thinking-bar" | "thinking-spinner" => set_transient(doc, event),
            "error" => {
                log::warn!("[chat] server experienced error producing system response");
                return Err(ChatSyncError::ServerError(event));
            }
            "chat" => {
                let chat: ChatEvent = serde_json::from_value(event)
                    .map_err(|e| ChatSyncError::Protocol(format!("Bad chat event: {}", e)))?;
                let plain = key
                    .key
                    .decrypt(&chat.encrypted_segment_data, clock.now_ms())
                    .map_err(ChatSyncError::Decrypt)?;
                let segment: SegmentData = serde_json::from_slice(&plain)
                    .map_err(|e| ChatSyncError::Protocol(format!("Bad segment data: {}", e)))?;
                for mutation in segment.mutations {
                    apply_mutation(doc, mutation).map_err(ChatSyncError::Protocol)?;
                }
                if !chat.more {
                    seen_end = true;
                }
                set_transient(doc, Value::Null);
            }
            other => log::warn!("[chat] ignoring unknown event {:?}", other),
        }
    }
    Ok(seen_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Fernet;

    fn key() -> WrappedClientKey {
        WrappedClientKey {
            uid: "ck".into(),
            key: Fernet::new(&Fernet::generate_key()).unwrap(),
        }
    }

    fn chat_event(key: &WrappedClientKey, clock: &ServerClock, mutations: Value, more: bool) -> Value {
        let token = key
            .key
            .encrypt(json!({"mutations": mutations}).to_string().as_bytes(), clock.now_ms());
        json!({"type": "chat", "encrypted_segment_data": token, "more": more})
    }

    #[test]
    fn budget_exhausts_on_fifth_failure_in_window() {
        let mut budget = RetryBudget::new(Duration::from_secs(300), 5, 1000);
        let start = Instant::now();
        for i in 0..4 {
            let delay = budget
                .record_failure(start + Duration::from_secs(10 * i))
                .expect("within budget");
            let n = (i + 1) as u32;
            let base = 1000u64 * (1 << n);
            assert!(delay >= Duration::from_millis(base / 2));
            assert!(delay < Duration::from_millis(base * 2));
        }
        assert_eq!(budget.record_failure(start + Duration::from_secs(40)), None);
    }

    #[test]
    fn old_failures_leave_the_window() {
        let mut budget = RetryBudget::new(Duration::from_secs(300), 5, 1000);
        let start = Instant::now();
        for at in [0, 100, 200, 310] {
            assert!(budget.record_failure(start + Duration::from_secs(at)).is_some());
        }
        assert!(budget.record_failure(start + Duration::from_secs(311)).is_some());
        assert_eq!(budget.failures_in_window(), 4);
    }

    #[test]
    fn thinking_then_chat_clears_transient() {
        let key = key();
        let clock = ServerClock::new();
        let mut doc = serde_json::to_value(JournalChatState::empty("e1")).unwrap();
        let events = vec![json!({"type": "thinking-spinner", "message": "Thinking", "detail": null})];
        assert!(!apply_events(&mut doc, events, &key, &clock).unwrap());
        assert_eq!(doc["transient"]["type"], "thinking-spinner");

        let item = json!({"type": "chat", "display_author": "other",
            "data": {"type": "textual", "parts": [{"type": "paragraph", "value": "Hello"}]}});
        let items: Vec<crate::chat::state::JournalEntryItem> =
            serde_json::from_value(json!([item.clone()])).unwrap();
        let mutations = json!([
            {"key": ["data", 0], "value": item},
            {"key": ["integrity"], "value": hash_items(&items)},
        ]);
        let events = vec![chat_event(&key, &clock, mutations, false)];
        assert!(apply_events(&mut doc, events, &key, &clock).unwrap());
        assert_eq!(doc["transient"], Value::Null);
        let state: JournalChatState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.integrity, hash_items(&state.data));
    }

    #[test]
    fn error_event_is_fatal() {
        let key = key();
        let clock = ServerClock::new();
        let mut doc = serde_json::to_value(JournalChatState::empty("e1")).unwrap();
        let err = apply_events(&mut doc, vec![json!({"type": "error", "message": "boom"})], &key, &clock)
            .unwrap_err();
        assert!(matches!(err, ChatSyncError::ServerError(_)));
    }

    #[test]
    fn out_of_range_mutation_is_a_protocol_error() {
        let key = key();
        let clock = ServerClock::new();
        let mut doc = serde_json::to_value(JournalChatState::empty("e1")).unwrap();
        let before = doc.clone();
        let event = chat_event(&key, &clock, json!([{"key": ["data", 5000], "value": {}}]), false);
        let err = apply_events(&mut doc, vec![event], &key, &clock).unwrap_err();
        assert!(matches!(err, ChatSyncError::Protocol(ref m) if m.contains("5000")));
        assert_eq!(doc, before);
    }

    #[test]
    fn segment_under_another_key_fails_to_decrypt() {
        let clock = ServerClock::new();
        let mut doc = serde_json::to_value(JournalChatState::empty("e1")).unwrap();
        let event = chat_event(&key(), &clock, json!([]), false);
        let err = apply_events(&mut doc, vec![event], &key(), &clock).unwrap_err();
        assert!(matches!(err, ChatSyncError::Decrypt(CryptoError::BadSignature)));
    }

    #[test]
    fn chat_url_joins_base() {
        let mut settings = Settings::default();
        settings.ws_base_url = "ws://127.0.0.1:9000/".into();
        assert_eq!(
            ChatSyncConfig::from_settings(&settings).chat_url(),
            "ws://127.0.0.1:9000/api/2/journals/chat"
        );
    }
}
