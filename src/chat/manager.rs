//! Per-entry chat state with at most one writer at a time.

use super::state::JournalChatState;
use super::sync::{sync_chat, ChatSyncConfig, ChatSyncError};
use crate::api::{jwt_expiration_ms, ApiClient, ApiError, User};
use crate::crypto::{ClientKeyStore, WrappedClientKey};
use crate::task::{CancelableTask, TaskHandle};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SYNC_ENDPOINT: &str = "/api/1/journals/entries/sync";
const REFRESH_MAX_RETRIES: u32 = 3;

/// What the sync-like endpoints hand back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryChatRef {
    pub journal_chat_jwt: String,
    pub journal_entry_uid: String,
    pub journal_entry_jwt: String,
}

/// Published chat. `Unavailable` follows an error; see the manager's error cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCell {
    Loading,
    Unavailable,
    Ready(JournalChatState),
}

impl ChatCell {
    pub fn state(&self) -> Option<&JournalChatState> {
        match self {
            ChatCell::Ready(s) => Some(s),
            _ => None,
        }
    }
}

pub type PublishFn = Box<dyn FnMut(JournalChatState) + Send>;

/// Everything the manager needs from the outside world.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    fn platform(&self) -> String;

    fn server_now_ms(&self) -> i64;

    async fn client_key(&self, user: &User) -> Result<WrappedClientKey, String>;

    async fn post_entry_ref(
        &self,
        endpoint: &str,
        body: &Value,
        user: &User,
    ) -> Result<JournalEntryChatRef, ApiError>;

    async fn sync_chat(
        &self,
        journal_chat_jwt: &str,
        journal_entry_uid: &str,
        key: &WrappedClientKey,
        cancel: &CancellationToken,
        publish: PublishFn,
    ) -> Result<JournalChatState, ChatSyncError>;
}

pub struct HttpJournalBackend {
    api: Arc<ApiClient>,
    keys: Arc<ClientKeyStore>,
    chat: ChatSyncConfig,
}

impl HttpJournalBackend {
    pub fn new(api: Arc<ApiClient>, keys: Arc<ClientKeyStore>, chat: ChatSyncConfig) -> Self {
        Self { api, keys, chat }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn keys(&self) -> &Arc<ClientKeyStore> {
        &self.keys
    }
}

#[async_trait]
impl JournalBackend for HttpJournalBackend {
    fn platform(&self) -> String {
        self.api.platform().to_string()
    }

    fn server_now_ms(&self) -> i64 {
        self.api.clock().now_ms()
    }

    async fn client_key(&self, user: &User) -> Result<WrappedClientKey, String> {
        self.keys
            .get_or_create_wrapped(user)
            .await
            .map_err(|e| format!("Failed to setup encryption: {}", e))
    }

    async fn post_entry_ref(
        &self,
        endpoint: &str,
        body: &Value,
        user: &User,
    ) -> Result<JournalEntryChatRef, ApiError> {
        self.api.post_json(endpoint, body, Some(&user.id_token)).await
    }

    async fn sync_chat(
        &self,
        journal_chat_jwt: &str,
        journal_entry_uid: &str,
        key: &WrappedClientKey,
        cancel: &CancellationToken,
        publish: PublishFn,
    ) -> Result<JournalChatState, ChatSyncError> {
        sync_chat(
            &self.chat,
            key,
            self.api.clock(),
            journal_chat_jwt,
            journal_entry_uid,
            cancel,
            publish,
        )
        .await
    }
}

pub type EntryTask = CancelableTask<Result<(), ChatSyncError>>;

/// Extra body fields computed once the client key is known.
pub type BonusParams =
    Box<dyn FnOnce(&WrappedClientKey) -> Result<Map<String, Value>, String> + Send>;

#[derive(Default)]
pub struct RefreshOptions {
    /// Defaults to the sync endpoint; must accept the same body and respond alike.
    pub endpoint: Option<String>,
    pub bonus_params: Option<BonusParams>,
    /// Set for non-idempotent endpoints; disables the retry on 429.
    pub unsafe_to_retry: bool,
}

struct Inner {
    uid: String,
    backend: Arc<dyn JournalBackend>,
    disposed: watch::Sender<bool>,
    jwt: watch::Sender<String>,
    chat: watch::Sender<ChatCell>,
    error: watch::Sender<Option<String>>,
    task: watch::Sender<Option<TaskHandle>>,
    admission: Mutex<()>,
}

/// Write access to a manager's cells, handed to task actions.
#[derive(Clone)]
pub struct EntryWriter {
    inner: Arc<Inner>,
}

impl EntryWriter {
    pub fn set_jwt(&self, jwt: String) {
        self.inner.jwt.send_replace(jwt);
    }

    pub fn jwt(&self) -> String {
        self.inner.jwt.borrow().clone()
    }

    pub fn set_chat(&self, chat: ChatCell) {
        self.inner.chat.send_replace(chat);
    }

    pub fn chat(&self) -> ChatCell {
        self.inner.chat.borrow().clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.inner.error.send_replace(error);
    }

    /// Records a failure: the error becomes visible and the chat unavailable.
    pub fn fail(&self, message: String) {
        self.set_error(Some(message));
        self.set_chat(ChatCell::Unavailable);
    }
}

/// Loads and keeps one journal entry's chat up to date.
///
/// Work happens in tasks started through [`JournalEntryManager::start_task`];
/// a newer task always cancels the older one and waits for it to settle
/// before its own action runs, so only one task ever writes the cells.
#[derive(Clone)]
pub struct JournalEntryManager {
    inner: Arc<Inner>,
}

impl JournalEntryManager {
    pub fn new(
        journal_entry_uid: impl Into<String>,
        journal_entry_jwt: impl Into<String>,
        backend: Arc<dyn JournalBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                uid: journal_entry_uid.into(),
                backend,
                disposed: watch::channel(false).0,
                jwt: watch::channel(journal_entry_jwt.into()).0,
                chat: watch::channel(ChatCell::Loading).0,
                error: watch::channel(None).0,
                task: watch::channel(None).0,
                admission: Mutex::new(()),
            }),
        }
    }

    pub fn journal_entry_uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn backend(&self) -> Arc<dyn JournalBackend> {
        self.inner.backend.clone()
    }

    pub fn journal_entry_jwt(&self) -> watch::Receiver<String> {
        self.inner.jwt.subscribe()
    }

    pub fn chat(&self) -> watch::Receiver<ChatCell> {
        self.inner.chat.subscribe()
    }

    pub fn error(&self) -> watch::Receiver<Option<String>> {
        self.inner.error.subscribe()
    }

    pub fn task(&self) -> watch::Receiver<Option<TaskHandle>> {
        self.inner.task.subscribe()
    }

    pub fn disposed(&self) -> watch::Receiver<bool> {
        self.inner.disposed.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    /// Replaces the held entry JWT, e.g. with a longer lived one.
    pub(crate) fn offer_jwt(&self, jwt: String) {
        self.inner.jwt.send_replace(jwt);
    }

    fn writer(&self) -> EntryWriter {
        EntryWriter {
            inner: self.inner.clone(),
        }
    }

    fn current_task_id(&self) -> Option<u64> {
        self.inner.task.borrow().as_ref().map(|t| t.id())
    }

    /// Runs `action` once every earlier task has been canceled and settled.
    ///
    /// Returns after the new task finishes, or straight away if the manager
    /// is (or becomes) disposed before the action could start. An `Err` from
    /// `action` is treated as a task that failed with that message.
    pub async fn start_task<F>(&self, action: F)
    where
        F: FnOnce(EntryWriter) -> Result<EntryTask, String>,
    {
        if self.is_disposed() {
            return;
        }
        let mut disposed = self.inner.disposed.subscribe();
        let mut action = Some(action);

        let new_task = loop {
            let current = self.inner.task.borrow().clone();
            if let Some(task) = &current {
                let mut task_rx = self.inner.task.subscribe();
                let old_id = task.id();
                task.cancel();
                tokio::select! {
                    _ = disposed.wait_for(|d| *d) => {}
                    _ = task.settled() => {}
                    _ = task_rx.wait_for(|t| t.as_ref().map(|h| h.id()) != Some(old_id)) => {}
                }
                if self.is_disposed() {
                    return;
                }
            }

            let _admission = match self.inner.admission.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = self.current_task_id();
            if now.is_some() && now != current.as_ref().map(|t| t.id()) {
                continue;
            }
            let Some(action) = action.take() else {
                return;
            };
            let task = match action(self.writer()) {
                Ok(task) => task,
                Err(message) => {
                    let writer = self.writer();
                    CancelableTask::spawn(move |token| async move {
                        if token.is_cancelled() {
                            return Err(ChatSyncError::Canceled);
                        }
                        writer.fail(message);
                        Ok(())
                    })
                }
            };
            self.inner.task.send_replace(Some(task.handle()));
            break task;
        };

        let id = new_task.handle().id();
        match new_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_canceled() => {}
            Ok(Err(e)) => {
                if !self.is_disposed() {
                    log::warn!("[entry] {} task error: {}", self.inner.uid, e);
                }
            }
            Err(e) => log::error!("[entry] {} task {}", self.inner.uid, e),
        }
        self.inner.task.send_if_modified(|t| {
            if t.as_ref().map(|h| h.id()) == Some(id) {
                *t = None;
                true
            } else {
                false
            }
        });
    }

    /// Builds the task behind [`attach`](Self::attach) without starting it
    /// through the admission queue.
    pub fn create_attach_task(
        &self,
        journal_chat_jwt: String,
        key: WrappedClientKey,
        sticky: bool,
    ) -> EntryTask {
        let writer = self.writer();
        CancelableTask::spawn(move |token| async move {
            run_attach(writer, journal_chat_jwt, key, sticky, token).await
        })
    }

    /// Streams the chat using an existing chat JWT.
    pub fn attach(&self, journal_chat_jwt: String, key: WrappedClientKey, sticky: bool) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let creator = manager.clone();
            manager
                .start_task(move |_| Ok(creator.create_attach_task(journal_chat_jwt, key, sticky)))
                .await
        })
    }

    pub fn create_refresh_task(&self, user: User, opts: RefreshOptions) -> EntryTask {
        let writer = self.writer();
        CancelableTask::spawn(move |token| async move { run_refresh(writer, user, opts, token).await })
    }

    /// Mints a fresh chat JWT from a sync-like endpoint, then attaches to it
    /// keeping the current chat on screen until new data arrives.
    pub fn refresh(&self, user: User, opts: RefreshOptions) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let creator = manager.clone();
            manager
                .start_task(move |_| Ok(creator.create_refresh_task(user, opts)))
                .await
        })
    }

    /// True once disposed or when the held entry JWT has expired. A JWT
    /// without a readable expiry counts as expired.
    pub fn is_expired_or_disposed(&self, now_server_ms: i64) -> bool {
        if self.is_disposed() {
            return true;
        }
        match jwt_expiration_ms(&self.inner.jwt.borrow()) {
            Some(exp) => exp < now_server_ms,
            None => true,
        }
    }

    /// Idempotent. The running task, if any, is canceled.
    pub fn dispose(&self) {
        if self.inner.disposed.send_replace(true) {
            return;
        }
        log::debug!("[entry] disposing {}", self.inner.uid);
        if let Some(task) = self.inner.task.borrow().as_ref() {
            task.cancel();
        }
    }
}

async fn run_attach(
    writer: EntryWriter,
    journal_chat_jwt: String,
    key: WrappedClientKey,
    sticky: bool,
    token: CancellationToken,
) -> Result<(), ChatSyncError> {
    if token.is_cancelled() {
        return Err(ChatSyncError::Canceled);
    }
    writer.set_error(None);

    let sticky_chat = if sticky {
        writer.chat().state().cloned()
    } else {
        None
    };
    let publish_writer = writer.clone();
    let publish_token = token.clone();
    let publish: PublishFn = Box::new(move |mine: JournalChatState| {
        if publish_token.is_cancelled() {
            return;
        }
        match &sticky_chat {
            Some(previous) if mine.data.is_empty() => publish_writer.set_chat(ChatCell::Ready(JournalChatState {
                transient: mine.transient,
                ..previous.clone()
            })),
            _ => publish_writer.set_chat(ChatCell::Ready(mine)),
        }
    });

    let backend = writer.inner.backend.clone();
    let result = backend
        .sync_chat(&journal_chat_jwt, &writer.inner.uid, &key, &token, publish)
        .await;
    if token.is_cancelled() {
        return Err(ChatSyncError::Canceled);
    }
    match result {
        Ok(done) => {
            writer.set_chat(ChatCell::Ready(done));
            Ok(())
        }
        Err(e) => {
            log::warn!("[entry] {} error in chat loop: {}", writer.inner.uid, e);
            Err(fail_unless_canceled(&writer, &token, e.to_string(), e))
        }
    }
}

/// Publishes a failure unless the task has been superseded, in which case the
/// newer task owns the cells.
fn fail_unless_canceled(
    writer: &EntryWriter,
    token: &CancellationToken,
    message: String,
    err: ChatSyncError,
) -> ChatSyncError {
    if token.is_cancelled() {
        return ChatSyncError::Canceled;
    }
    writer.fail(message);
    err
}

async fn run_refresh(
    writer: EntryWriter,
    user: User,
    opts: RefreshOptions,
    token: CancellationToken,
) -> Result<(), ChatSyncError> {
    if token.is_cancelled() {
        return Err(ChatSyncError::Canceled);
    }
    writer.set_error(None);
    let backend = writer.inner.backend.clone();

    let key = tokio::select! {
        _ = token.cancelled() => return Err(ChatSyncError::Canceled),
        k = backend.client_key(&user) => k,
    };
    let key = match key {
        Ok(k) => k,
        Err(message) => {
            let err = ChatSyncError::Key(message.clone());
            return Err(fail_unless_canceled(&writer, &token, message, err));
        }
    };

    let endpoint = opts
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_SYNC_ENDPOINT.to_string());
    let mut body = Map::new();
    body.insert("platform".into(), Value::String(backend.platform()));
    body.insert("journal_entry_uid".into(), Value::String(writer.inner.uid.clone()));
    body.insert("journal_entry_jwt".into(), Value::String(writer.jwt()));
    body.insert("journal_client_key_uid".into(), Value::String(key.uid.clone()));
    if let Some(bonus) = opts.bonus_params {
        match bonus(&key) {
            Ok(extra) => body.extend(extra),
            Err(message) => {
                let err = ChatSyncError::Protocol(message.clone());
                return Err(fail_unless_canceled(&writer, &token, message, err));
            }
        }
    }
    let body = Value::Object(body);

    let mut i: u32 = 0;
    let grant = loop {
        if token.is_cancelled() {
            return Err(ChatSyncError::Canceled);
        }
        if i > REFRESH_MAX_RETRIES {
            return Err(fail_unless_canceled(
                &writer,
                &token,
                "too many retries".into(),
                ChatSyncError::TooManyRetries,
            ));
        }
        if i > 0 {
            let jitter = rand::thread_rng().gen_range(0.0..500.0);
            let delay = Duration::from_millis(1000 * (1u64 << i) + jitter as u64);
            log::debug!("[entry] retrying {} in {:?}", endpoint, delay);
            tokio::select! {
                _ = token.cancelled() => return Err(ChatSyncError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let result = tokio::select! {
            _ = token.cancelled() => return Err(ChatSyncError::Canceled),
            r = backend.post_entry_ref(&endpoint, &body, &user) => r,
        };
        match result {
            Ok(grant) => break grant,
            Err(e) if e.status() == Some(429) && !opts.unsafe_to_retry => {
                i += 1;
            }
            Err(e) => {
                log::warn!("[entry] error starting sync via {}: {}", endpoint, e);
                let message = e.to_string();
                return Err(fail_unless_canceled(
                    &writer,
                    &token,
                    message.clone(),
                    ChatSyncError::Protocol(message),
                ));
            }
        }
    };

    if token.is_cancelled() {
        return Err(ChatSyncError::Canceled);
    }
    writer.set_jwt(grant.journal_entry_jwt);
    run_attach(writer, grant.journal_chat_jwt, key, true, token).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chat::state::{DisplayAuthor, EntryItemData, EntryItemKind, JournalEntryItem, TextualPart, TransientHint};
    use crate::crypto::Fernet;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::time::Instant;

    pub(crate) fn user() -> User {
        User {
            sub: "u1".into(),
            id_token: "token".into(),
        }
    }

    pub(crate) fn key() -> WrappedClientKey {
        WrappedClientKey {
            uid: "ck".into(),
            key: Fernet::new(&Fernet::generate_key()).unwrap(),
        }
    }

    fn with_message(uid: &str, text: &str) -> JournalChatState {
        let mut s = JournalChatState::empty(uid);
        s.data.push(JournalEntryItem {
            data: EntryItemData::Textual {
                parts: vec![TextualPart::Paragraph { value: text.into() }],
            },
            display_author: DisplayAuthor::Other,
            kind: EntryItemKind::Chat,
        });
        s.integrity = crate::chat::integrity::hash_items(&s.data);
        s
    }

    #[derive(Clone, Copy, PartialEq)]
    enum SyncMode {
        /// Publishes one message and completes.
        Complete,
        /// Publishes an empty document with a thinking hint, then waits to be canceled.
        ThinkAndHold,
        Reject,
    }

    struct FakeBackend {
        mode: SyncMode,
        rate_limited: AtomicU32,
        posts: Mutex<Vec<Value>>,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl FakeBackend {
        fn new(mode: SyncMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                rate_limited: AtomicU32::new(0),
                posts: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JournalBackend for FakeBackend {
        fn platform(&self) -> String {
            "test".into()
        }

        fn server_now_ms(&self) -> i64 {
            crate::clock::local_now_ms()
        }

        async fn client_key(&self, _user: &User) -> Result<WrappedClientKey, String> {
            Ok(key())
        }

        async fn post_entry_ref(
            &self,
            _endpoint: &str,
            body: &Value,
            _user: &User,
        ) -> Result<JournalEntryChatRef, ApiError> {
            self.posts.lock().unwrap().push(body.clone());
            if self.rate_limited.load(Ordering::SeqCst) > 0 {
                self.rate_limited.fetch_sub(1, Ordering::SeqCst);
                return Err(ApiError::Status {
                    status: 429,
                    body: String::new(),
                    retry_after_ms: None,
                });
            }
            Ok(JournalEntryChatRef {
                journal_chat_jwt: "chat-jwt".into(),
                journal_entry_uid: "e1".into(),
                journal_entry_jwt: "fresh-entry-jwt".into(),
            })
        }

        async fn sync_chat(
            &self,
            _journal_chat_jwt: &str,
            journal_entry_uid: &str,
            _key: &WrappedClientKey,
            cancel: &CancellationToken,
            mut publish: PublishFn,
        ) -> Result<JournalChatState, ChatSyncError> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            let result = match self.mode {
                SyncMode::Complete => {
                    publish(JournalChatState::empty(journal_entry_uid));
                    tokio::task::yield_now().await;
                    let done = with_message(journal_entry_uid, "hello");
                    publish(done.clone());
                    Ok(done)
                }
                SyncMode::ThinkAndHold => {
                    let mut empty = JournalChatState::empty(journal_entry_uid);
                    empty.transient = Some(TransientHint::ThinkingSpinner {
                        message: "Thinking".into(),
                        detail: None,
                    });
                    publish(empty);
                    cancel.cancelled().await;
                    Err(ChatSyncError::Canceled)
                }
                SyncMode::Reject => Err(ChatSyncError::AuthorizationRejected),
            };
            tokio::task::yield_now().await;
            self.live.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn attach_publishes_final_chat() {
        let backend = FakeBackend::new(SyncMode::Complete);
        let manager = JournalEntryManager::new("e1", "jwt", backend);
        manager.attach("chat".into(), key(), false).await.unwrap();
        let chat = manager.chat().borrow().clone();
        assert_eq!(chat.state().unwrap().data.len(), 1);
        assert_eq!(*manager.error().borrow(), None);
        assert!(manager.task().borrow().is_none());
    }

    #[tokio::test]
    async fn sync_failure_sets_error_and_unavailable() {
        let backend = FakeBackend::new(SyncMode::Reject);
        let manager = JournalEntryManager::new("e1", "jwt", backend);
        manager.attach("chat".into(), key(), false).await.unwrap();
        assert_eq!(*manager.chat().borrow(), ChatCell::Unavailable);
        assert_eq!(manager.error().borrow().as_deref(), Some("authorization rejected"));
    }

    #[tokio::test]
    async fn failing_action_becomes_failed_task() {
        let manager = JournalEntryManager::new("e1", "jwt", FakeBackend::new(SyncMode::Complete));
        manager.start_task(|_| Err("no key".into())).await;
        assert_eq!(manager.error().borrow().as_deref(), Some("no key"));
        assert_eq!(*manager.chat().borrow(), ChatCell::Unavailable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_task_is_ever_live() {
        let backend = FakeBackend::new(SyncMode::ThinkAndHold);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        let handles: Vec<_> = (0..8)
            .map(|_| manager.attach("chat".into(), key(), false))
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.live.load(Ordering::SeqCst), 1);
        manager.dispose();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(backend.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disposed_manager_starts_nothing() {
        let backend = FakeBackend::new(SyncMode::Complete);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        manager.dispose();
        manager.attach("chat".into(), key(), false).await.unwrap();
        assert_eq!(backend.max_live.load(Ordering::SeqCst), 0);
        assert_eq!(*manager.chat().borrow(), ChatCell::Loading);
        assert!(manager.is_expired_or_disposed(0));
    }

    #[tokio::test]
    async fn sticky_attach_keeps_previous_chat_until_data() {
        let backend = FakeBackend::new(SyncMode::ThinkAndHold);
        let manager = JournalEntryManager::new("e1", "jwt", backend);
        let previous = with_message("e1", "earlier");
        manager.writer().set_chat(ChatCell::Ready(previous.clone()));

        let handle = manager.attach("chat".into(), key(), true);
        let mut chat = manager.chat();
        let shown = chat
            .wait_for(|c| c.state().map_or(false, |s| s.transient.is_some()))
            .await
            .unwrap()
            .clone();
        let shown = shown.state().unwrap();
        assert_eq!(shown.data, previous.data);
        assert!(matches!(shown.transient, Some(TransientHint::ThinkingSpinner { .. })));
        manager.dispose();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_backs_off_on_rate_limit() {
        let backend = FakeBackend::new(SyncMode::Complete);
        backend.rate_limited.store(3, Ordering::SeqCst);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        let started = Instant::now();
        manager.refresh(user(), RefreshOptions::default()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(15_500), "{:?}", elapsed);

        let posts = backend.posts.lock().unwrap();
        assert_eq!(posts.len(), 4);
        assert_eq!(posts[0]["journal_entry_jwt"], "jwt");
        assert_eq!(posts[0]["journal_client_key_uid"], "ck");
        assert_eq!(posts[0]["platform"], "test");
        drop(posts);
        assert_eq!(*manager.journal_entry_jwt().borrow(), "fresh-entry-jwt");
        assert!(manager.chat().borrow().state().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_gives_up_after_three_retries() {
        let backend = FakeBackend::new(SyncMode::Complete);
        backend.rate_limited.store(10, Ordering::SeqCst);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        manager.refresh(user(), RefreshOptions::default()).await.unwrap();
        assert_eq!(backend.posts.lock().unwrap().len(), 4);
        assert_eq!(manager.error().borrow().as_deref(), Some("too many retries"));
    }

    #[tokio::test]
    async fn unsafe_refresh_does_not_retry_and_sends_bonus_params() {
        let backend = FakeBackend::new(SyncMode::Complete);
        backend.rate_limited.store(1, Ordering::SeqCst);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        let opts = RefreshOptions {
            endpoint: Some("/api/1/journals/entries/chat/".into()),
            bonus_params: Some(Box::new(|k: &WrappedClientKey| {
                let mut extra = Map::new();
                extra.insert("seen_key".into(), Value::String(k.uid.clone()));
                Ok(extra)
            })),
            unsafe_to_retry: true,
        };
        manager.refresh(user(), opts).await.unwrap();
        let posts = backend.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["seen_key"], "ck");
        assert!(manager.error().borrow().is_some());
    }

    #[tokio::test]
    async fn superseded_refresh_does_not_publish_its_failure() {
        let backend = FakeBackend::new(SyncMode::Complete);
        let manager = JournalEntryManager::new("e1", "jwt", backend.clone());
        let shown = with_message("e1", "newer task's chat");
        manager.writer().set_chat(ChatCell::Ready(shown.clone()));

        let token = CancellationToken::new();
        let superseded = token.clone();
        let opts = RefreshOptions {
            bonus_params: Some(Box::new(move |_: &WrappedClientKey| {
                superseded.cancel();
                Err("Failed to encrypt reply".to_string())
            })),
            ..RefreshOptions::default()
        };
        let err = run_refresh(manager.writer(), user(), opts, token).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(*manager.error().borrow(), None);
        assert_eq!(*manager.chat().borrow(), ChatCell::Ready(shown));
        assert!(backend.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_refresh_publishes_its_failure() {
        let manager = JournalEntryManager::new("e1", "jwt", FakeBackend::new(SyncMode::Complete));
        let opts = RefreshOptions {
            bonus_params: Some(Box::new(|_: &WrappedClientKey| Err("Failed to encrypt reply".to_string()))),
            ..RefreshOptions::default()
        };
        let err = run_refresh(manager.writer(), user(), opts, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ChatSyncError::Protocol(_)));
        assert_eq!(manager.error().borrow().as_deref(), Some("Failed to encrypt reply"));
        assert_eq!(*manager.chat().borrow(), ChatCell::Unavailable);
    }

    #[test]
    fn expiry_comes_from_the_entry_jwt() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let jwt = format!("h.{}.s", URL_SAFE_NO_PAD.encode(r#"{"exp":1000}"#));
        let manager = JournalEntryManager::new("e1", jwt, FakeBackend::new(SyncMode::Complete));
        assert!(!manager.is_expired_or_disposed(999_000));
        assert!(manager.is_expired_or_disposed(1_000_001));
    }
}
