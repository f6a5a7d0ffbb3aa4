use super::content::{ContentFileRef, ContentPlaylist};
use super::transcript::EncryptedTranscript;
use crate::api::{ApiClient, ApiError, LoginState, User};
use crate::crypto::{ClientKeyStore, WrappedClientKey};
use crate::upload::{FileUploadDescriptor, UploadJob};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

pub const CREATE_VOICE_NOTE_ENDPOINT: &str = "/api/1/voice_notes/";
pub const SHOW_TRANSCRIPT_ENDPOINT: &str = "/api/1/voice_notes/show_transcript";
pub const SHOW_AUDIO_ENDPOINT: &str = "/api/1/voice_notes/show_audio";

/// A voice note the server knows about, with the JWT granting access to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceNoteRef {
    pub uid: String,
    pub jwt: String,
}

/// Response of creating a voice note: where to upload its audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedVoiceNote {
    pub voice_note: VoiceNoteRef,
    pub file_upload: FileUploadDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowAudioResponse {
    pub audio_content_file: ContentFileRef,
    pub duration_seconds: f64,
    pub encrypted_binned_time_vs_intensity: String,
}

/// Everything the voice note machine needs from the server. Each method is a
/// single attempt; the machine owns retrying.
#[async_trait]
pub trait VoiceNoteBackend: Send + Sync {
    fn login(&self) -> watch::Receiver<LoginState>;

    fn server_now_ms(&self) -> i64;

    async fn client_key(&self, user: &User) -> Result<WrappedClientKey, String>;

    async fn create_voice_note(&self, user: &User, file_size: u64) -> Result<CreatedVoiceNote, ApiError>;

    fn start_upload(&self, descriptor: &FileUploadDescriptor, data: Vec<u8>) -> UploadJob;

    async fn show_transcript(
        &self,
        user: &User,
        voice_note: &VoiceNoteRef,
        journal_client_key_uid: &str,
    ) -> Result<EncryptedTranscript, ApiError>;

    async fn show_audio(
        &self,
        user: &User,
        voice_note: &VoiceNoteRef,
        journal_client_key_uid: &str,
    ) -> Result<ShowAudioResponse, ApiError>;

    async fn content_playlist(&self, content: &ContentFileRef) -> Result<ContentPlaylist, ApiError>;

    async fn download(&self, url: &str, content: &ContentFileRef) -> Result<Vec<u8>, ApiError>;
}

/// Current user or `NotLoggedIn`; read fresh on every attempt.
pub fn current_user(backend: &dyn VoiceNoteBackend) -> Result<User, ApiError> {
    let login = backend.login();
    let user = login.borrow().user().cloned();
    user.ok_or(ApiError::NotLoggedIn)
}

pub struct HttpVoiceNoteBackend {
    api: Arc<ApiClient>,
    keys: Arc<ClientKeyStore>,
    login: watch::Receiver<LoginState>,
}

impl HttpVoiceNoteBackend {
    pub fn new(api: Arc<ApiClient>, keys: Arc<ClientKeyStore>, login: watch::Receiver<LoginState>) -> Self {
        Self { api, keys, login }
    }
}

#[async_trait]
impl VoiceNoteBackend for HttpVoiceNoteBackend {
    fn login(&self) -> watch::Receiver<LoginState> {
        self.login.clone()
    }

    fn server_now_ms(&self) -> i64 {
        self.api.clock().now_ms()
    }

    async fn client_key(&self, user: &User) -> Result<WrappedClientKey, String> {
        self.keys
            .get_or_create_wrapped(user)
            .await
            .map_err(|e| format!("Failed to get client key: {}", e))
    }

    async fn create_voice_note(&self, user: &User, file_size: u64) -> Result<CreatedVoiceNote, ApiError> {
        let body = json!({ "file_size": file_size });
        self.api
            .post_json(CREATE_VOICE_NOTE_ENDPOINT, &body, Some(&user.id_token))
            .await
    }

    fn start_upload(&self, descriptor: &FileUploadDescriptor, data: Vec<u8>) -> UploadJob {
        UploadJob::start_http(self.api.clone(), descriptor, data)
    }

    async fn show_transcript(
        &self,
        user: &User,
        voice_note: &VoiceNoteRef,
        journal_client_key_uid: &str,
    ) -> Result<EncryptedTranscript, ApiError> {
        let body = json!({
            "voice_note_uid": voice_note.uid,
            "voice_note_jwt": voice_note.jwt,
            "journal_client_key_uid": journal_client_key_uid,
        });
        self.api
            .post_json(SHOW_TRANSCRIPT_ENDPOINT, &body, Some(&user.id_token))
            .await
    }

    async fn show_audio(
        &self,
        user: &User,
        voice_note: &VoiceNoteRef,
        journal_client_key_uid: &str,
    ) -> Result<ShowAudioResponse, ApiError> {
        let body = json!({
            "voice_note_uid": voice_note.uid,
            "voice_note_jwt": voice_note.jwt,
            "journal_client_key_uid": journal_client_key_uid,
        });
        self.api
            .post_json(SHOW_AUDIO_ENDPOINT, &body, Some(&user.id_token))
            .await
    }

    async fn content_playlist(&self, content: &ContentFileRef) -> Result<ContentPlaylist, ApiError> {
        self.api
            .get_json(&content.playlist_path(), Some(&content.jwt))
            .await
    }

    async fn download(&self, url: &str, content: &ContentFileRef) -> Result<Vec<u8>, ApiError> {
        self.api.get_bytes(url, Some(&content.jwt)).await
    }
}
