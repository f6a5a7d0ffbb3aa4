//! Transitions for a voice note fetched from the server.

use super::backend::{current_user, ShowAudioResponse, VoiceNoteBackend};
use super::content::{select_audio_target, AudioData, ContentFileRef, ContentPlaylist, RequestData, ResourceRequest};
use super::state::*;
use super::transcript::{decrypt_intensity, decrypt_transcript, EncryptedTranscript, Transcript};
use super::{
    next_message, race, released_or_unexpected, settle_fetch, spawn_transcript_fetch, Driver, Race, VoiceNoteError,
    VoiceNoteMessage,
};
use crate::api::{resolve_login, spawn_fetch, ApiError, FetchTask, RetryPolicy};
use crate::task::TaskError;
use std::sync::Arc;

fn error(message: &str) -> Phase {
    Phase::Error(message.to_string())
}

async fn release_fetch<T>(task: Option<FetchTask<T>>) {
    if let Some(task) = task {
        let _ = task.release().await;
    }
}

/// Resolves a pending fetch; never resolves once it has been taken.
async fn settle<T>(task: &mut Option<FetchTask<T>>) -> Result<Result<T, ApiError>, TaskError> {
    match task.as_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn playlist_request(backend: &Arc<dyn VoiceNoteBackend>, content: &ContentFileRef) -> ResourceRequest<ContentPlaylist> {
    let backend = backend.clone();
    let content = content.clone();
    ResourceRequest::spawn(RetryPolicy::ExpoBackoff3, "content playlist", move || {
        let backend = backend.clone();
        let content = content.clone();
        async move { backend.content_playlist(&content).await }
    })
}

fn audio_request(backend: &Arc<dyn VoiceNoteBackend>, url: &str, content: &ContentFileRef) -> ResourceRequest<AudioData> {
    let backend = backend.clone();
    let url = url.to_string();
    let content = content.clone();
    ResourceRequest::spawn(RetryPolicy::ExpoBackoff3, "voice note audio", move || {
        let backend = backend.clone();
        let url = url.clone();
        let content = content.clone();
        async move {
            let bytes = backend.download(&url, &content).await?;
            Ok(AudioData {
                bytes: Arc::new(bytes),
                mime: "audio/mp4".to_string(),
            })
        }
    })
}

pub(super) async fn from_remote_initializing(s: RemoteInitializing, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    const KIND: VoiceNoteKind = VoiceNoteKind::RemoteInitializing;
    let voice_note = s.voice_note;

    let mut login = d.ctx.backend.login();
    let user = match race(&mut d.inbox, resolve_login(&mut login)).await {
        Race::Message(msg) => return released_or_unexpected(KIND, msg),
        Race::Done(Some(user)) => user,
        Race::Done(None) => return Ok(error("Not logged in")),
    };

    let key = match race(&mut d.inbox, d.ctx.backend.client_key(&user)).await {
        Race::Message(msg) => return released_or_unexpected(KIND, msg),
        Race::Done(Ok(key)) => key,
        Race::Done(Err(e)) => {
            log::warn!("[voice-note] {}", e);
            return Ok(error("Failed to setup encryption"));
        }
    };

    let audio = {
        let backend = d.ctx.backend.clone();
        let voice_note = voice_note.clone();
        let key_uid = key.uid.clone();
        spawn_fetch(RetryPolicy::ExpoBackoff3, "show audio", move || {
            let backend = backend.clone();
            let voice_note = voice_note.clone();
            let key_uid = key_uid.clone();
            async move {
                let user = current_user(&*backend)?;
                backend.show_audio(&user, &voice_note, &key_uid).await
            }
        })
    };
    let transcript = spawn_transcript_fetch(&d.ctx.backend, &voice_note, &key.uid, RetryPolicy::ExpoBackoff3);

    Ok(Phase::RemoteInitialized(RemoteInitialized {
        voice_note,
        key,
        audio,
        transcript,
    }))
}

enum Loaded {
    Message(VoiceNoteMessage),
    Audio(Result<Result<ShowAudioResponse, ApiError>, TaskError>),
    Transcript(Result<Result<EncryptedTranscript, ApiError>, TaskError>),
}

pub(super) async fn from_remote_initialized(s: RemoteInitialized, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let RemoteInitialized {
        voice_note,
        key,
        audio,
        transcript,
    } = s;
    // Each task is taken out of its slot as soon as it settles so it is
    // never polled again.
    let mut audio_task = Some(audio);
    let mut transcript_task = Some(transcript);
    let mut remote_audio: Option<RemoteAudio> = None;
    let mut loaded_transcript: Option<Transcript> = None;

    while audio_task.is_some() || transcript_task.is_some() {
        let loaded = tokio::select! {
            msg = next_message(&mut d.inbox) => Loaded::Message(msg),
            r = settle(&mut audio_task), if audio_task.is_some() => Loaded::Audio(r),
            r = settle(&mut transcript_task), if transcript_task.is_some() => Loaded::Transcript(r),
        };
        let failure = match loaded {
            Loaded::Message(msg) => {
                release_fetch(audio_task.take()).await;
                release_fetch(transcript_task.take()).await;
                return released_or_unexpected(VoiceNoteKind::RemoteInitialized, msg);
            }
            Loaded::Audio(r) => {
                audio_task = None;
                match settle_fetch("show audio", r, "Failed to load audio") {
                    Ok(resp) => {
                        match decrypt_intensity(&key, &resp.encrypted_binned_time_vs_intensity, d.ctx.backend.server_now_ms()) {
                            Ok(tvi) => {
                                remote_audio = Some(RemoteAudio {
                                    content: resp.audio_content_file,
                                    time_vs_intensity: Arc::new(tvi),
                                    duration_seconds: resp.duration_seconds,
                                });
                                None
                            }
                            Err(e) => {
                                log::warn!("[voice-note] {}", e);
                                Some("Failed to decrypt audio".to_string())
                            }
                        }
                    }
                    Err(message) => Some(message),
                }
            }
            Loaded::Transcript(r) => {
                transcript_task = None;
                match settle_fetch("show transcript", r, "Failed to load transcript") {
                    Ok(encrypted) => {
                        match decrypt_transcript(&key, &encrypted.encrypted_transcript, d.ctx.backend.server_now_ms()) {
                            Ok(t) => {
                                loaded_transcript = Some(t);
                                None
                            }
                            Err(e) => {
                                log::warn!("[voice-note] {}", e);
                                Some("Failed to decrypt transcript".to_string())
                            }
                        }
                    }
                    Err(message) => Some(message),
                }
            }
        };
        if let Some(message) = failure {
            release_fetch(audio_task.take()).await;
            release_fetch(transcript_task.take()).await;
            return Ok(Phase::Error(message));
        }
    }

    let (Some(audio), Some(transcript)) = (remote_audio, loaded_transcript) else {
        return Err(VoiceNoteError::MissingData("audio or transcript"));
    };
    let playlist_request = playlist_request(&d.ctx.backend, &audio.content);
    Ok(Phase::RemoteSelectingExport(RemoteSelectingExport {
        voice_note,
        audio,
        transcript: Arc::new(transcript),
        playlist_request,
    }))
}

pub(super) async fn from_remote_selecting_export(
    s: RemoteSelectingExport,
    d: &mut Driver,
) -> Result<Phase, VoiceNoteError> {
    let RemoteSelectingExport {
        voice_note,
        audio,
        transcript,
        playlist_request,
    } = s;

    let settled = match race(&mut d.inbox, playlist_request.settled()).await {
        Race::Message(msg) => {
            playlist_request.release();
            return released_or_unexpected(VoiceNoteKind::RemoteSelectingExport, msg);
        }
        Race::Done(settled) => settled,
    };
    let playlist = match settled {
        RequestData::Success(playlist) => playlist,
        other => {
            log::warn!("[voice-note] playlist unavailable: {:?}", other);
            playlist_request.release();
            return Ok(error("Failed to load audio playlist"));
        }
    };

    let Some(target) = select_audio_target(&playlist) else {
        playlist_request.release();
        return Ok(error("No suitable export found for this audio file"));
    };
    log::debug!("[voice-note] downloading {} ({} bps)", target.url, target.bandwidth);
    let request = audio_request(&d.ctx.backend, &target.url, &audio.content);

    Ok(Phase::RemoteDownloadingAudio(RemoteDownloadingAudio {
        voice_note,
        audio,
        transcript,
        playlist_request,
        playlist,
        request,
    }))
}

pub(super) async fn from_remote_downloading_audio(
    s: RemoteDownloadingAudio,
    d: &mut Driver,
) -> Result<Phase, VoiceNoteError> {
    let RemoteDownloadingAudio {
        voice_note,
        audio,
        transcript,
        playlist_request,
        playlist,
        request,
    } = s;

    let settled = match race(&mut d.inbox, request.settled()).await {
        Race::Message(msg) => {
            request.release();
            playlist_request.release();
            return released_or_unexpected(VoiceNoteKind::RemoteDownloadingAudio, msg);
        }
        Race::Done(settled) => settled,
    };
    let playable = match settled {
        RequestData::Success(data) => data,
        other => {
            log::warn!("[voice-note] audio unavailable: {:?}", other);
            request.release();
            playlist_request.release();
            return Ok(error("Failed to load audio"));
        }
    };

    Ok(Phase::RemoteReady(RemoteReady {
        voice_note,
        audio,
        transcript,
        playlist_request,
        playlist,
        request,
        playable,
    }))
}

pub(super) async fn from_remote_ready(s: RemoteReady, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let msg = next_message(&mut d.inbox).await;
    s.request.release();
    s.playlist_request.release();
    released_or_unexpected(VoiceNoteKind::RemoteReady, msg)
}
