//! Voice notes: recording one locally and taking it through upload and
//! transcription, or fetching someone else's for playback.
//!
//! A machine is one spawned driver owning the current [`Phase`]. The driver
//! runs one transition at a time; each transition races the single-slot
//! mailbox against whatever its phase is waiting on, tears down what it owns
//! on the way out, and hands the next phase only what it needs. Observers see
//! a [`VoiceNoteView`] published after every transition.

pub mod analysis;
pub mod backend;
#[cfg(feature = "microphone")]
pub mod capture_cpal;
pub mod content;
mod local;
pub mod local_file;
pub mod platform;
mod remote;
pub mod state;
pub mod transcript;


use crate::api::{spawn_fetch, ApiError, FetchTask, RetryPolicy};
use crate::mailbox::{mailbox, MailboxClosed, MailboxReceiver, MailboxSender};
use crate::task::TaskError;
use analysis::LiveIntensity;
use backend::{current_user, VoiceNoteBackend, VoiceNoteRef};
use platform::{CaptureBackend, LocalPlayback, WavPlayback};
use state::{Phase, RemoteInitializing, VoiceNoteKind, VoiceNoteView};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transcript::EncryptedTranscript;

pub use backend::HttpVoiceNoteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceNoteMessage {
    Record,
    StopRecording,
    Release,
}

/// Logic errors. The machine is forced to `released` before one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceNoteError {
    #[error("{0} did not transition")]
    DidNotTransition(VoiceNoteKind),
    #[error("unsupported message in {state}: {message:?}")]
    UnexpectedMessage {
        state: VoiceNoteKind,
        message: VoiceNoteMessage,
    },
    #[error("missing {0}")]
    MissingData(&'static str),
    #[error("driver stopped: {0}")]
    Driver(#[from] TaskError),
}

/// What a machine runs against.
#[derive(Clone)]
pub struct VoiceNoteContext {
    pub backend: Arc<dyn VoiceNoteBackend>,
    /// `None` where recording is unsupported.
    pub capture: Option<Arc<dyn CaptureBackend>>,
    pub playback: Arc<dyn LocalPlayback>,
    /// Where recorded clips are written for local playback.
    pub temp_dir: PathBuf,
}

impl VoiceNoteContext {
    pub fn new(backend: Arc<dyn VoiceNoteBackend>) -> Self {
        Self {
            backend,
            capture: None,
            playback: Arc::new(WavPlayback),
            temp_dir: std::env::temp_dir().join("voicejournal"),
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureBackend>) -> Self {
        self.capture = Some(capture);
        self
    }
}

pub type AssignUid = Box<dyn FnMut(&str) + Send>;

/// State the driver threads through every transition.
pub(crate) struct Driver {
    pub(crate) inbox: MailboxReceiver<VoiceNoteMessage>,
    pub(crate) ctx: VoiceNoteContext,
    pub(crate) assign_uid: Option<AssignUid>,
    pub(crate) live: watch::Sender<LiveIntensity>,
}

/// Outcome of racing the mailbox against a phase's own work.
pub(crate) enum Race<T> {
    Message(VoiceNoteMessage),
    Done(T),
}

/// Next message. A machine nobody can message any more is treated as
/// released.
pub(crate) async fn next_message(inbox: &mut MailboxReceiver<VoiceNoteMessage>) -> VoiceNoteMessage {
    inbox.recv().await.unwrap_or(VoiceNoteMessage::Release)
}

/// Races `work` against the mailbox. Whichever loses is dropped; the mailbox
/// keeps any message it did not hand out.
pub(crate) async fn race<F: Future>(inbox: &mut MailboxReceiver<VoiceNoteMessage>, work: F) -> Race<F::Output> {
    tokio::select! {
        msg = next_message(inbox) => Race::Message(msg),
        out = work => Race::Done(out),
    }
}

/// `release` moves to `released`; any other message is a logic error.
pub(crate) fn released_or_unexpected(state: VoiceNoteKind, msg: VoiceNoteMessage) -> Result<Phase, VoiceNoteError> {
    match msg {
        VoiceNoteMessage::Release => Ok(Phase::Released),
        message => Err(VoiceNoteError::UnexpectedMessage { state, message }),
    }
}

/// Unwraps a settled fetch, or logs it and returns the message the user sees.
pub(crate) fn settle_fetch<T>(
    label: &str,
    result: Result<Result<T, ApiError>, TaskError>,
    fallback: &str,
) -> Result<T, String> {
    match result {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(ApiError::NotLoggedIn)) => {
            log::warn!("[voice-note] {}: not logged in", label);
            Err("Not logged in".to_string())
        }
        Ok(Err(e)) => {
            log::warn!("[voice-note] {} failed: {}", label, e);
            Err(fallback.to_string())
        }
        Err(e) => {
            log::warn!("[voice-note] {} stopped: {}", label, e);
            Err(fallback.to_string())
        }
    }
}

pub(crate) fn spawn_transcript_fetch(
    backend: &Arc<dyn VoiceNoteBackend>,
    voice_note: &VoiceNoteRef,
    key_uid: &str,
    policy: RetryPolicy,
) -> FetchTask<EncryptedTranscript> {
    let backend = backend.clone();
    let voice_note = voice_note.clone();
    let key_uid = key_uid.to_string();
    spawn_fetch(policy, "show transcript", move || {
        let backend = backend.clone();
        let voice_note = voice_note.clone();
        let key_uid = key_uid.clone();
        async move {
            let user = current_user(&*backend)?;
            backend.show_transcript(&user, &voice_note, &key_uid).await
        }
    })
}

async fn step(phase: Phase, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    match phase {
        Phase::InitializingForRecording => local::from_initializing_for_recording(d).await,
        Phase::InitializedForRecording(s) => local::from_initialized_for_recording(s, d).await,
        Phase::Recording(s) => local::from_recording(s, d).await,
        Phase::Recorded(s) => Ok(local::from_recorded(s)),
        Phase::InitializingLocalStream(s) => Ok(local::from_initializing_local_stream(s, d)),
        Phase::InitializingLocalPlay(s) => local::from_initializing_local_play(s, d).await,
        Phase::InitializingUpload(s) => local::from_initializing_upload(s, d).await,
        Phase::Uploading(s) => local::from_uploading(s, d).await,
        Phase::Transcribing(s) => local::from_transcribing(s, d).await,
        Phase::LocalReady(s) => local::from_local_ready(s, d).await,
        Phase::RemoteInitializing(s) => remote::from_remote_initializing(s, d).await,
        Phase::RemoteInitialized(s) => remote::from_remote_initialized(s, d).await,
        Phase::RemoteSelectingExport(s) => remote::from_remote_selecting_export(s, d).await,
        Phase::RemoteDownloadingAudio(s) => remote::from_remote_downloading_audio(s, d).await,
        Phase::RemoteReady(s) => remote::from_remote_ready(s, d).await,
        Phase::Error(_) => {
            let msg = next_message(&mut d.inbox).await;
            released_or_unexpected(VoiceNoteKind::Error, msg)
        }
        Phase::Released => Ok(Phase::Released),
    }
}

fn force_release(state: &watch::Sender<VoiceNoteView>, d: &mut Driver, err: VoiceNoteError) -> VoiceNoteError {
    log::error!("[voice-note] {}", err);
    state.send_if_modified(|v| {
        if v.kind == VoiceNoteKind::Released {
            false
        } else {
            *v = VoiceNoteView::of(VoiceNoteKind::Released);
            true
        }
    });
    d.inbox.close();
    err
}

async fn drive(mut phase: Phase, mut d: Driver, state: watch::Sender<VoiceNoteView>) -> Result<(), VoiceNoteError> {
    loop {
        let from = phase.kind();
        if from == VoiceNoteKind::Released {
            d.inbox.close();
            return Ok(());
        }
        let next = match step(phase, &mut d).await {
            Ok(next) => next,
            Err(e) => return Err(force_release(&state, &mut d, e)),
        };
        if next.kind() == from {
            drop(next);
            return Err(force_release(&state, &mut d, VoiceNoteError::DidNotTransition(from)));
        }
        log::debug!("[voice-note] {} -> {}", from, next.kind());
        state.send_replace(next.view());
        phase = next;
    }
}

/// Handle to a running voice note.
pub struct VoiceNoteMachine {
    state: watch::Receiver<VoiceNoteView>,
    live: watch::Receiver<LiveIntensity>,
    sender: MailboxSender<VoiceNoteMessage>,
    driver: JoinHandle<Result<(), VoiceNoteError>>,
}

impl VoiceNoteMachine {
    /// Starts preparing the microphone. `assign_uid` is called once the
    /// server assigns the note its uid, before the upload starts.
    pub fn for_local_upload<A>(ctx: VoiceNoteContext, assign_uid: A) -> Self
    where
        A: FnMut(&str) + Send + 'static,
    {
        Self::spawn(Phase::InitializingForRecording, ctx, Some(Box::new(assign_uid)))
    }

    /// Starts loading an existing voice note and keeps it until released.
    pub fn for_remote_download(ctx: VoiceNoteContext, voice_note: VoiceNoteRef) -> Self {
        Self::spawn(Phase::RemoteInitializing(RemoteInitializing { voice_note }), ctx, None)
    }

    fn spawn(initial: Phase, ctx: VoiceNoteContext, assign_uid: Option<AssignUid>) -> Self {
        let (state_tx, state) = watch::channel(initial.view());
        let (live_tx, live) = watch::channel(LiveIntensity::default());
        let (sender, inbox) = mailbox();
        let driver = Driver {
            inbox,
            ctx,
            assign_uid,
            live: live_tx,
        };
        let driver = tokio::spawn(drive(initial, driver, state_tx));
        Self {
            state,
            live,
            sender,
            driver,
        }
    }

    pub fn state(&self) -> watch::Receiver<VoiceNoteView> {
        self.state.clone()
    }

    pub fn kind(&self) -> VoiceNoteKind {
        self.state.borrow().kind
    }

    /// The rolling waveform while recording.
    pub fn live_intensity(&self) -> watch::Receiver<LiveIntensity> {
        self.live.clone()
    }

    pub fn sender(&self) -> MailboxSender<VoiceNoteMessage> {
        self.sender.clone()
    }

    /// Resolves once the driver has taken the message. Fails once the
    /// machine is released.
    pub async fn send(&self, msg: VoiceNoteMessage) -> Result<(), MailboxClosed> {
        self.sender.send(msg).await
    }

    /// Drops this handle's sender and waits for the driver. With no other
    /// senders alive the machine releases itself.
    pub async fn join(self) -> Result<(), VoiceNoteError> {
        drop(self.sender);
        self.driver.await.map_err(|e| {
            if e.is_panic() {
                VoiceNoteError::Driver(TaskError::Panicked)
            } else {
                VoiceNoteError::Driver(TaskError::Aborted)
            }
        })?
    }
}
