//! Transitions for a voice note recorded on this device.

use super::analysis::{duration_seconds, envelopes, LiveIntensity, RecordingAnalysis};
use super::backend::current_user;
use super::local_file::{extension_for, LocalStream};
use super::platform::{CaptureError, CaptureEvent, CaptureSession};
use super::state::*;
use super::transcript::decrypt_transcript;
use super::{
    next_message, race, released_or_unexpected, settle_fetch, spawn_transcript_fetch, Driver, Race, VoiceNoteError,
    VoiceNoteMessage,
};
use crate::api::{spawn_fetch, RetryPolicy};
use crate::task::CancelableTask;
use crate::upload::UploadStatus;
use std::sync::Arc;
use tokio::time::Instant;

fn error(message: &str) -> Phase {
    Phase::Error(message.to_string())
}

pub(super) async fn from_initializing_for_recording(d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let Some(capture) = d.ctx.capture.clone() else {
        log::warn!("[voice-note] no capture backend");
        return Ok(error("Recording not supported"));
    };
    let mut opening = CancelableTask::spawn(move |_| async move { capture.open().await });
    let opened = match race(&mut d.inbox, &mut opening).await {
        Race::Message(msg) => {
            // Whatever the open produced still has to be closed.
            if let Ok(Ok(session)) = opening.release().await {
                session.close();
            }
            return released_or_unexpected(VoiceNoteKind::InitializingForRecording, msg);
        }
        Race::Done(opened) => opened,
    };
    match opened {
        Ok(Ok(session)) => Ok(Phase::InitializedForRecording(InitializedForRecording { session })),
        Ok(Err(CaptureError::Unsupported)) => Ok(error("Recording not supported")),
        Ok(Err(CaptureError::NoDevice(e))) => {
            log::warn!("[voice-note] no input device: {}", e);
            Ok(error("No audio device available for recording"))
        }
        Ok(Err(CaptureError::Setup(e))) => {
            log::warn!("[voice-note] recorder setup failed: {}", e);
            Ok(error("Failed to initialize analyser and recorder from audio input"))
        }
        Err(e) => {
            log::warn!("[voice-note] opening input failed: {}", e);
            Ok(error("Failed to initialize analyser and recorder from audio input"))
        }
    }
}

pub(super) async fn from_initialized_for_recording(
    s: InitializedForRecording,
    d: &mut Driver,
) -> Result<Phase, VoiceNoteError> {
    let mut session = s.session;
    match next_message(&mut d.inbox).await {
        VoiceNoteMessage::Record => {}
        msg => {
            session.close();
            return released_or_unexpected(VoiceNoteKind::InitializedForRecording, msg);
        }
    }

    if let Err(e) = session.start() {
        log::warn!("[voice-note] start failed: {}", e);
        session.close();
        return Ok(error("Failed to start recording"));
    }

    let started = loop {
        let next = race(&mut d.inbox, session.next_event()).await;
        match next {
            Race::Message(msg) => {
                session.stop();
                session.close();
                return released_or_unexpected(VoiceNoteKind::InitializedForRecording, msg);
            }
            Race::Done(Some(CaptureEvent::Started { at_ms })) => break Ok(at_ms),
            Race::Done(Some(CaptureEvent::Stopped { .. })) => {}
            Race::Done(Some(CaptureEvent::Error(e))) => break Err(e),
            Race::Done(None) => break Err("recorder went away".to_string()),
        }
    };
    match started {
        Ok(started_at_ms) => {
            log::info!("[voice-note] recording");
            d.live.send_replace(LiveIntensity::default());
            Ok(Phase::Recording(Recording {
                session,
                started_at_ms,
                started_at_wall_ms: crate::clock::local_now_ms(),
                analysis: RecordingAnalysis::new(Instant::now()),
            }))
        }
        Err(e) => {
            log::warn!("[voice-note] recorder did not start: {}", e);
            session.stop();
            session.close();
            Ok(error("Failed to start recording"))
        }
    }
}

enum RecordingStep {
    Message(VoiceNoteMessage),
    Event(Option<CaptureEvent>),
    Tick,
}

/// Waits for the recorder to report it stopped.
async fn stopped(session: &mut Box<dyn CaptureSession>) -> Result<f64, String> {
    loop {
        match session.next_event().await {
            Some(CaptureEvent::Stopped { at_ms }) => return Ok(at_ms),
            Some(CaptureEvent::Started { .. }) => {}
            Some(CaptureEvent::Error(e)) => return Err(e),
            None => return Err("recorder went away".to_string()),
        }
    }
}

pub(super) async fn from_recording(s: Recording, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let Recording {
        mut session,
        started_at_ms,
        started_at_wall_ms,
        mut analysis,
    } = s;

    let exit = loop {
        let next_bin = analysis.next_bin_at();
        let step = tokio::select! {
            msg = next_message(&mut d.inbox) => RecordingStep::Message(msg),
            event = session.next_event() => RecordingStep::Event(event),
            _ = tokio::time::sleep_until(next_bin) => RecordingStep::Tick,
        };
        match step {
            RecordingStep::Tick => {
                let live = analysis.tick(Instant::now(), |buf| session.read_time_domain(buf));
                d.live.send_replace(live);
            }
            RecordingStep::Event(Some(CaptureEvent::Started { .. })) => {}
            RecordingStep::Event(event) => break Err(event),
            RecordingStep::Message(msg) => break Ok(msg),
        }
    };

    let msg = match exit {
        Ok(msg) => msg,
        Err(event) => {
            log::warn!("[voice-note] recorder stopped unexpectedly: {:?}", event);
            session.stop();
            session.close();
            return Ok(error("Error while recording"));
        }
    };

    session.stop();
    match msg {
        VoiceNoteMessage::StopRecording => {}
        msg => {
            session.close();
            return released_or_unexpected(VoiceNoteKind::Recording, msg);
        }
    }

    let stopped_at_ms = match race(&mut d.inbox, stopped(&mut session)).await {
        Race::Message(msg) => {
            session.close();
            return released_or_unexpected(VoiceNoteKind::Recording, msg);
        }
        Race::Done(Ok(at_ms)) => at_ms,
        Race::Done(Err(e)) => {
            log::warn!("[voice-note] stopping failed: {}", e);
            session.close();
            return Ok(error("Error while recording"));
        }
    };
    let recording = session.take_recording();
    session.close();

    let duration = duration_seconds(started_at_ms, stopped_at_ms);
    log::info!(
        "[voice-note] recorded {:.2}s ({} bytes) started at {}",
        duration,
        recording.data.len(),
        started_at_wall_ms
    );
    Ok(Phase::Recorded(Recorded {
        audio: RecordedAudio {
            data: recording.data,
            mime: recording.mime,
            time_vs_intensity: vec![analysis.bins().to_vec()],
            duration_seconds: duration,
        },
    }))
}

pub(super) fn from_recorded(s: Recorded) -> Phase {
    Phase::InitializingLocalStream(InitializingLocalStream { audio: s.audio })
}

pub(super) fn from_initializing_local_stream(s: InitializingLocalStream, d: &Driver) -> Phase {
    let audio = s.audio;
    match LocalStream::create(&d.ctx.temp_dir, &audio.data, extension_for(&audio.mime)) {
        Ok(stream) => Phase::InitializingLocalPlay(InitializingLocalPlay { audio, stream }),
        Err(e) => {
            log::warn!("[voice-note] {}", e);
            error("Failed to create local audio file")
        }
    }
}

pub(super) async fn from_initializing_local_play(
    s: InitializingLocalPlay,
    d: &mut Driver,
) -> Result<Phase, VoiceNoteError> {
    const KIND: VoiceNoteKind = VoiceNoteKind::InitializingLocalPlay;
    let InitializingLocalPlay { audio, stream } = s;
    let playback = d.ctx.playback.clone();
    let path = stream.path().to_path_buf();

    // Decoding for the waveform and probing for playability are independent.
    let loaded = async { tokio::join!(playback.decode_pcm(&path), playback.probe(&path)) };
    let (decoded, probed) = match race(&mut d.inbox, loaded).await {
        Race::Message(msg) => {
            stream.release();
            return released_or_unexpected(KIND, msg);
        }
        Race::Done(loaded) => loaded,
    };
    let time_vs_intensity = match decoded {
        Ok(pcm) => envelopes(&pcm),
        Err(e) => {
            log::warn!("[voice-note] keeping live intensity, decode failed: {}", e);
            audio.time_vs_intensity
        }
    };
    let duration_seconds = match probed {
        Ok(Some(secs)) if secs.is_finite() => secs,
        Ok(_) => audio.duration_seconds,
        Err(e) => {
            log::warn!("[voice-note] local clip not playable: {}", e);
            stream.release();
            return Ok(error("Failed to load audio"));
        }
    };

    let file_size = audio.data.len() as u64;
    let backend = d.ctx.backend.clone();
    let provision = spawn_fetch(RetryPolicy::ExpoBackoff3, "create voice note", move || {
        let backend = backend.clone();
        async move {
            let user = current_user(&*backend)?;
            backend.create_voice_note(&user, file_size).await
        }
    });

    Ok(Phase::InitializingUpload(InitializingUpload {
        audio: LocalAudio {
            stream,
            time_vs_intensity: Arc::new(time_vs_intensity),
            duration_seconds,
        },
        data: audio.data,
        provision,
    }))
}

pub(super) async fn from_initializing_upload(s: InitializingUpload, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let InitializingUpload {
        audio,
        data,
        mut provision,
    } = s;

    let created = match race(&mut d.inbox, &mut provision).await {
        Race::Message(msg) => {
            let _ = provision.release().await;
            audio.stream.release();
            return released_or_unexpected(VoiceNoteKind::InitializingUpload, msg);
        }
        Race::Done(created) => created,
    };
    let created = match settle_fetch("create voice note", created, "Failed to initialize voice note") {
        Ok(created) => created,
        Err(message) => {
            audio.stream.release();
            return Ok(Phase::Error(message));
        }
    };

    let Some(assign_uid) = d.assign_uid.as_mut() else {
        audio.stream.release();
        return Err(VoiceNoteError::MissingData("uid callback"));
    };
    assign_uid(&created.voice_note.uid);

    log::info!("[voice-note] uploading {} as {}", data.len(), created.voice_note.uid);
    let upload = d.ctx.backend.start_upload(&created.file_upload, data);
    Ok(Phase::Uploading(Uploading {
        audio,
        voice_note: created.voice_note,
        upload,
    }))
}

pub(super) async fn from_uploading(s: Uploading, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let Uploading {
        audio,
        voice_note,
        upload,
    } = s;

    let user = match current_user(&*d.ctx.backend) {
        Ok(user) => user,
        Err(_) => {
            upload.release().await;
            audio.stream.release();
            return Ok(error("Not logged in"));
        }
    };

    let backend = d.ctx.backend.clone();
    let ready = async { tokio::join!(upload.finished(), backend.client_key(&user)) };
    let (status, key) = match race(&mut d.inbox, ready).await {
        Race::Message(msg) => {
            upload.release().await;
            audio.stream.release();
            return released_or_unexpected(VoiceNoteKind::Uploading, msg);
        }
        Race::Done(ready) => ready,
    };
    upload.release().await;

    if status != UploadStatus::Success {
        log::warn!("[voice-note] upload ended as {:?}", status);
        audio.stream.release();
        return Ok(error("Failed to upload voice note"));
    }
    let key = match key {
        Ok(key) => key,
        Err(e) => {
            log::warn!("[voice-note] {}", e);
            audio.stream.release();
            return Ok(error("Failed to setup encryption"));
        }
    };

    let poll = spawn_transcript_fetch(&d.ctx.backend, &voice_note, &key.uid, RetryPolicy::Forever5);
    Ok(Phase::Transcribing(Transcribing {
        audio,
        voice_note,
        key,
        poll,
    }))
}

pub(super) async fn from_transcribing(s: Transcribing, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let Transcribing {
        audio,
        voice_note,
        key,
        mut poll,
    } = s;

    let polled = match race(&mut d.inbox, &mut poll).await {
        Race::Message(msg) => {
            let _ = poll.release().await;
            audio.stream.release();
            return released_or_unexpected(VoiceNoteKind::Transcribing, msg);
        }
        Race::Done(polled) => polled,
    };
    let encrypted = match settle_fetch("show transcript", polled, "Failed to transcribe voice note") {
        Ok(encrypted) => encrypted,
        Err(message) => {
            audio.stream.release();
            return Ok(Phase::Error(message));
        }
    };

    match decrypt_transcript(&key, &encrypted.encrypted_transcript, d.ctx.backend.server_now_ms()) {
        Ok(transcript) => Ok(Phase::LocalReady(LocalReady {
            audio,
            voice_note,
            transcript: Arc::new(transcript),
        })),
        Err(e) => {
            log::warn!("[voice-note] {}", e);
            audio.stream.release();
            Ok(error("Failed to decrypt transcript"))
        }
    }
}

pub(super) async fn from_local_ready(s: LocalReady, d: &mut Driver) -> Result<Phase, VoiceNoteError> {
    let msg = next_message(&mut d.inbox).await;
    s.audio.stream.release();
    released_or_unexpected(VoiceNoteKind::LocalReady, msg)
}
