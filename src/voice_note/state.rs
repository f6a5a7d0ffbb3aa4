use super::analysis::RecordingAnalysis;
use super::backend::{CreatedVoiceNote, ShowAudioResponse, VoiceNoteRef};
use super::content::{AudioData, ContentFileRef, ContentPlaylist, ResourceRequest};
use super::local_file::LocalStream;
use super::platform::CaptureSession;
use super::transcript::{EncryptedTranscript, Transcript};
use crate::api::FetchTask;
use crate::crypto::WrappedClientKey;
use crate::upload::UploadJob;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceNoteKind {
    InitializingForRecording,
    InitializedForRecording,
    Recording,
    Recorded,
    InitializingLocalStream,
    InitializingLocalPlay,
    InitializingUpload,
    Uploading,
    Transcribing,
    LocalReady,
    RemoteInitializing,
    RemoteInitialized,
    RemoteSelectingExport,
    RemoteDownloadingAudio,
    RemoteReady,
    Error,
    Released,
}

impl VoiceNoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceNoteKind::InitializingForRecording => "initializing-for-recording",
            VoiceNoteKind::InitializedForRecording => "initialized-for-recording",
            VoiceNoteKind::Recording => "recording",
            VoiceNoteKind::Recorded => "recorded",
            VoiceNoteKind::InitializingLocalStream => "initializing-local-stream",
            VoiceNoteKind::InitializingLocalPlay => "initializing-local-play",
            VoiceNoteKind::InitializingUpload => "initializing-upload",
            VoiceNoteKind::Uploading => "uploading",
            VoiceNoteKind::Transcribing => "transcribing",
            VoiceNoteKind::LocalReady => "local-ready",
            VoiceNoteKind::RemoteInitializing => "remote-initializing",
            VoiceNoteKind::RemoteInitialized => "remote-initialized",
            VoiceNoteKind::RemoteSelectingExport => "remote-selecting-export",
            VoiceNoteKind::RemoteDownloadingAudio => "remote-downloading-audio",
            VoiceNoteKind::RemoteReady => "remote-ready",
            VoiceNoteKind::Error => "error",
            VoiceNoteKind::Released => "released",
        }
    }
}

impl fmt::Display for VoiceNoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a player can open.
#[derive(Debug, Clone, PartialEq)]
pub enum Playable {
    File(PathBuf),
    Memory(Arc<AudioData>),
}

/// What observers see of a voice note. Resources stay inside the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceNoteView {
    pub kind: VoiceNoteKind,
    pub error: Option<String>,
    pub voice_note_uid: Option<String>,
    pub duration_seconds: Option<f64>,
    /// Envelopes at decreasing resolution, each normalized to 0..1.
    pub time_vs_intensity: Option<Arc<Vec<Vec<f32>>>>,
    pub transcript: Option<Arc<Transcript>>,
    pub playable: Option<Playable>,
}

impl VoiceNoteView {
    pub fn of(kind: VoiceNoteKind) -> Self {
        Self {
            kind,
            error: None,
            voice_note_uid: None,
            duration_seconds: None,
            time_vs_intensity: None,
            transcript: None,
            playable: None,
        }
    }
}

/// The clip as recorded, before it is written anywhere.
pub struct RecordedAudio {
    pub data: Vec<u8>,
    pub mime: String,
    pub time_vs_intensity: Vec<Vec<f32>>,
    pub duration_seconds: f64,
}

/// The clip once it can be played locally.
pub struct LocalAudio {
    pub stream: LocalStream,
    pub time_vs_intensity: Arc<Vec<Vec<f32>>>,
    pub duration_seconds: f64,
}

impl LocalAudio {
    fn fill(&self, view: &mut VoiceNoteView) {
        view.duration_seconds = Some(self.duration_seconds);
        view.time_vs_intensity = Some(self.time_vs_intensity.clone());
        view.playable = Some(Playable::File(self.stream.path().to_path_buf()));
    }
}

/// Audio details of a remote voice note once `show_audio` is decrypted.
pub struct RemoteAudio {
    pub content: ContentFileRef,
    pub time_vs_intensity: Arc<Vec<Vec<f32>>>,
    pub duration_seconds: f64,
}

pub struct InitializedForRecording {
    pub session: Box<dyn CaptureSession>,
}

pub struct Recording {
    pub session: Box<dyn CaptureSession>,
    /// Recorder clock time of the start event.
    pub started_at_ms: f64,
    /// Wall clock approximation of the same moment.
    pub started_at_wall_ms: i64,
    pub analysis: RecordingAnalysis,
}

pub struct Recorded {
    pub audio: RecordedAudio,
}

pub struct InitializingLocalStream {
    pub audio: RecordedAudio,
}

pub struct InitializingLocalPlay {
    pub audio: RecordedAudio,
    pub stream: LocalStream,
}

pub struct InitializingUpload {
    pub audio: LocalAudio,
    pub data: Vec<u8>,
    pub provision: FetchTask<CreatedVoiceNote>,
}

pub struct Uploading {
    pub audio: LocalAudio,
    pub voice_note: VoiceNoteRef,
    pub upload: UploadJob,
}

pub struct Transcribing {
    pub audio: LocalAudio,
    pub voice_note: VoiceNoteRef,
    pub key: WrappedClientKey,
    pub poll: FetchTask<EncryptedTranscript>,
}

pub struct LocalReady {
    pub audio: LocalAudio,
    pub voice_note: VoiceNoteRef,
    pub transcript: Arc<Transcript>,
}

pub struct RemoteInitializing {
    pub voice_note: VoiceNoteRef,
}

pub struct RemoteInitialized {
    pub voice_note: VoiceNoteRef,
    pub key: WrappedClientKey,
    pub audio: FetchTask<ShowAudioResponse>,
    pub transcript: FetchTask<EncryptedTranscript>,
}

pub struct RemoteSelectingExport {
    pub voice_note: VoiceNoteRef,
    pub audio: RemoteAudio,
    pub transcript: Arc<Transcript>,
    pub playlist_request: ResourceRequest<ContentPlaylist>,
}

pub struct RemoteDownloadingAudio {
    pub voice_note: VoiceNoteRef,
    pub audio: RemoteAudio,
    pub transcript: Arc<Transcript>,
    pub playlist_request: ResourceRequest<ContentPlaylist>,
    pub playlist: Arc<ContentPlaylist>,
    pub request: ResourceRequest<AudioData>,
}

pub struct RemoteReady {
    pub voice_note: VoiceNoteRef,
    pub audio: RemoteAudio,
    pub transcript: Arc<Transcript>,
    pub playlist_request: ResourceRequest<ContentPlaylist>,
    pub playlist: Arc<ContentPlaylist>,
    pub request: ResourceRequest<AudioData>,
    pub playable: Arc<AudioData>,
}

/// Every state a voice note passes through, each owning exactly the
/// resources its phase needs.
pub enum Phase {
    InitializingForRecording,
    InitializedForRecording(InitializedForRecording),
    Recording(Recording),
    Recorded(Recorded),
    InitializingLocalStream(InitializingLocalStream),
    InitializingLocalPlay(InitializingLocalPlay),
    InitializingUpload(InitializingUpload),
    Uploading(Uploading),
    Transcribing(Transcribing),
    LocalReady(LocalReady),
    RemoteInitializing(RemoteInitializing),
    RemoteInitialized(RemoteInitialized),
    RemoteSelectingExport(RemoteSelectingExport),
    RemoteDownloadingAudio(RemoteDownloadingAudio),
    RemoteReady(RemoteReady),
    Error(String),
    Released,
}

impl Phase {
    pub fn kind(&self) -> VoiceNoteKind {
        match self {
            Phase::InitializingForRecording => VoiceNoteKind::InitializingForRecording,
            Phase::InitializedForRecording(_) => VoiceNoteKind::InitializedForRecording,
            Phase::Recording(_) => VoiceNoteKind::Recording,
            Phase::Recorded(_) => VoiceNoteKind::Recorded,
            Phase::InitializingLocalStream(_) => VoiceNoteKind::InitializingLocalStream,
            Phase::InitializingLocalPlay(_) => VoiceNoteKind::InitializingLocalPlay,
            Phase::InitializingUpload(_) => VoiceNoteKind::InitializingUpload,
            Phase::Uploading(_) => VoiceNoteKind::Uploading,
            Phase::Transcribing(_) => VoiceNoteKind::Transcribing,
            Phase::LocalReady(_) => VoiceNoteKind::LocalReady,
            Phase::RemoteInitializing(_) => VoiceNoteKind::RemoteInitializing,
            Phase::RemoteInitialized(_) => VoiceNoteKind::RemoteInitialized,
            Phase::RemoteSelectingExport(_) => VoiceNoteKind::RemoteSelectingExport,
            Phase::RemoteDownloadingAudio(_) => VoiceNoteKind::RemoteDownloadingAudio,
            Phase::RemoteReady(_) => VoiceNoteKind::RemoteReady,
            Phase::Error(_) => VoiceNoteKind::Error,
            Phase::Released => VoiceNoteKind::Released,
        }
    }

    pub fn view(&self) -> VoiceNoteView {
        let mut view = VoiceNoteView::of(self.kind());
        match self {
            Phase::InitializingForRecording
            | Phase::InitializedForRecording(_)
            | Phase::Recording(_)
            | Phase::Released => {}
            Phase::Recorded(Recorded { audio })
            | Phase::InitializingLocalStream(InitializingLocalStream { audio })
            | Phase::InitializingLocalPlay(InitializingLocalPlay { audio, .. }) => {
                view.duration_seconds = Some(audio.duration_seconds);
                view.time_vs_intensity = Some(Arc::new(audio.time_vs_intensity.clone()));
            }
            Phase::InitializingUpload(s) => s.audio.fill(&mut view),
            Phase::Uploading(s) => {
                s.audio.fill(&mut view);
                view.voice_note_uid = Some(s.voice_note.uid.clone());
            }
            Phase::Transcribing(s) => {
                s.audio.fill(&mut view);
                view.voice_note_uid = Some(s.voice_note.uid.clone());
            }
            Phase::LocalReady(s) => {
                s.audio.fill(&mut view);
                view.voice_note_uid = Some(s.voice_note.uid.clone());
                view.transcript = Some(s.transcript.clone());
            }
            Phase::RemoteInitializing(RemoteInitializing { voice_note })
            | Phase::RemoteInitialized(RemoteInitialized { voice_note, .. }) => {
                view.voice_note_uid = Some(voice_note.uid.clone());
            }
            Phase::RemoteSelectingExport(RemoteSelectingExport {
                voice_note,
                audio,
                transcript,
                ..
            })
            | Phase::RemoteDownloadingAudio(RemoteDownloadingAudio {
                voice_note,
                audio,
                transcript,
                ..
            }) => {
                view.voice_note_uid = Some(voice_note.uid.clone());
                view.duration_seconds = Some(audio.duration_seconds);
                view.time_vs_intensity = Some(audio.time_vs_intensity.clone());
                view.transcript = Some(transcript.clone());
            }
            Phase::RemoteReady(s) => {
                view.voice_note_uid = Some(s.voice_note.uid.clone());
                view.duration_seconds = Some(s.audio.duration_seconds);
                view.time_vs_intensity = Some(s.audio.time_vs_intensity.clone());
                view.transcript = Some(s.transcript.clone());
                view.playable = Some(Playable::Memory(s.playable.clone()));
            }
            Phase::Error(message) => view.error = Some(message.clone()),
        }
        view
    }
}
