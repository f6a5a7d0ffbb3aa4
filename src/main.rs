use std::sync::Arc;
use tokio::sync::watch;
use voicejournal::api::{ApiClient, LoginState, User};
use voicejournal::chat::{ChatCell, ChatSyncConfig, HttpJournalBackend, JournalEntryManager, RefreshOptions};
use voicejournal::clock::ServerClock;
use voicejournal::crypto::ClientKeyStore;
use voicejournal::settings::{self, Settings};
use voicejournal::voice_note::backend::VoiceNoteRef;
use voicejournal::voice_note::state::{Playable, VoiceNoteKind, VoiceNoteView};
use voicejournal::voice_note::{HttpVoiceNoteBackend, VoiceNoteContext, VoiceNoteMachine, VoiceNoteMessage};

const USAGE: &str = "usage:
  voicejournal login <id-token> <user-sub>
  voicejournal keys
  voicejournal sync <entry-uid> <entry-jwt>
  voicejournal voice-note <voice-note-uid> <voice-note-jwt> [out-file]
  voicejournal record <seconds>            (with the microphone feature)";

struct Services {
    api: Arc<ApiClient>,
    keys: Arc<ClientKeyStore>,
    login: watch::Receiver<LoginState>,
    _login_tx: watch::Sender<LoginState>,
}

impl Services {
    fn new(settings: &Settings) -> Result<Self, String> {
        let api = Arc::new(ApiClient::from_settings(settings, Arc::new(ServerClock::new())));
        let keys = Arc::new(ClientKeyStore::in_data_dir(api.clone())?);
        let state = if settings.id_token.is_empty() {
            LoginState::LoggedOut
        } else {
            LoginState::LoggedIn(User {
                sub: settings.user_sub.clone(),
                id_token: settings.id_token.clone(),
            })
        };
        let (login_tx, login) = watch::channel(state);
        Ok(Self {
            api,
            keys,
            login,
            _login_tx: login_tx,
        })
    }

    fn user(&self) -> Result<User, String> {
        self.login
            .borrow()
            .user()
            .cloned()
            .ok_or_else(|| "Not logged in; run `voicejournal login` first".to_string())
    }

    fn voice_note_context(&self) -> VoiceNoteContext {
        let backend = HttpVoiceNoteBackend::new(self.api.clone(), self.keys.clone(), self.login.clone());
        VoiceNoteContext::new(Arc::new(backend))
    }
}

fn login(settings: &mut Settings, id_token: &str, sub: &str) -> Result<(), String> {
    settings.id_token = id_token.to_string();
    settings.user_sub = sub.to_string();
    settings::save(settings)?;
    println!("[voicejournal] saved login for {}", sub);
    Ok(())
}

async fn keys(settings: &Settings) -> Result<(), String> {
    let services = Services::new(settings)?;
    let user = services.user()?;
    let key = services
        .keys
        .get_or_create(&user)
        .await
        .map_err(|e| format!("Failed to get client key: {}", e))?;
    println!("[voicejournal] journal client key {}", key.uid);
    Ok(())
}

async fn sync(settings: &Settings, uid: &str, jwt: &str) -> Result<(), String> {
    let services = Services::new(settings)?;
    let user = services.user()?;
    let backend = HttpJournalBackend::new(
        services.api.clone(),
        services.keys.clone(),
        ChatSyncConfig::from_settings(settings),
    );
    let manager = JournalEntryManager::new(uid, jwt, Arc::new(backend));
    let mut chat = manager.chat();
    let mut refresh = manager.refresh(user, RefreshOptions::default());

    loop {
        tokio::select! {
            done = &mut refresh => {
                done.map_err(|e| format!("Refresh task failed: {}", e))?;
                break;
            }
            changed = chat.changed() => {
                if changed.is_err() {
                    break;
                }
                if let ChatCell::Ready(state) = &*chat.borrow_and_update() {
                    log::info!("[voicejournal] chat {} has {} items", state.uid, state.data.len());
                }
            }
        }
    }

    let error = manager.error().borrow().clone();
    let result = match (&*manager.chat().borrow(), error) {
        (_, Some(error)) => Err(error),
        (ChatCell::Ready(state), None) => {
            for item in &state.data {
                println!("{} {}", item.display_author.as_str(), item.kind.as_str());
            }
            Ok(())
        }
        (cell, None) => Err(format!("Chat did not load: {:?}", cell)),
    };
    manager.dispose();
    result
}

async fn wait_settled(machine: &VoiceNoteMachine, kind: VoiceNoteKind) -> VoiceNoteView {
    let mut state = machine.state();
    let view = match state
        .wait_for(|v| v.kind == kind || v.kind == VoiceNoteKind::Error || v.kind == VoiceNoteKind::Released)
        .await
    {
        Ok(view) => view.clone(),
        Err(_) => VoiceNoteView::of(VoiceNoteKind::Released),
    };
    view
}

fn print_transcript(view: &VoiceNoteView) {
    if let Some(transcript) = &view.transcript {
        for phrase in &transcript.phrases {
            println!("[{:>7.2} - {:>7.2}] {}", phrase.starts_at, phrase.ends_at, phrase.phrase);
        }
    }
}

async fn finish(machine: VoiceNoteMachine, view: VoiceNoteView) -> Result<(), String> {
    let _ = machine.send(VoiceNoteMessage::Release).await;
    machine.join().await.map_err(|e| e.to_string())?;
    match view.error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn voice_note(settings: &Settings, uid: &str, jwt: &str, out: Option<&str>) -> Result<(), String> {
    let services = Services::new(settings)?;
    let machine = VoiceNoteMachine::for_remote_download(
        services.voice_note_context(),
        VoiceNoteRef {
            uid: uid.to_string(),
            jwt: jwt.to_string(),
        },
    );
    let view = wait_settled(&machine, VoiceNoteKind::RemoteReady).await;
    if view.kind == VoiceNoteKind::RemoteReady {
        print_transcript(&view);
        if let (Some(out), Some(Playable::Memory(audio))) = (out, &view.playable) {
            std::fs::write(out, audio.bytes.as_slice()).map_err(|e| format!("Failed to write {}: {}", out, e))?;
            println!("[voicejournal] wrote {} ({})", out, audio.mime);
        }
    }
    finish(machine, view).await
}

#[cfg(feature = "microphone")]
async fn record(settings: &Settings, seconds: &str) -> Result<(), String> {
    use std::time::Duration;
    use voicejournal::voice_note::capture_cpal::CpalCapture;

    let seconds: f64 = seconds.parse().map_err(|e| format!("Invalid duration: {}", e))?;
    let services = Services::new(settings)?;
    let ctx = services
        .voice_note_context()
        .with_capture(Arc::new(CpalCapture::new(None)));
    let machine = VoiceNoteMachine::for_local_upload(ctx, |uid: &str| {
        println!("[voicejournal] voice note {}", uid);
    });

    let view = wait_settled(&machine, VoiceNoteKind::InitializedForRecording).await;
    if view.kind != VoiceNoteKind::InitializedForRecording {
        return finish(machine, view).await;
    }
    machine
        .send(VoiceNoteMessage::Record)
        .await
        .map_err(|e| e.to_string())?;
    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.5))).await;
    machine
        .send(VoiceNoteMessage::StopRecording)
        .await
        .map_err(|e| e.to_string())?;

    let view = wait_settled(&machine, VoiceNoteKind::LocalReady).await;
    print_transcript(&view);
    finish(machine, view).await
}

#[cfg(not(feature = "microphone"))]
async fn record(_settings: &Settings, _seconds: &str) -> Result<(), String> {
    Err("Recording not supported; rebuild with --features microphone".to_string())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut settings = settings::load();
    let result = match args.as_slice() {
        ["login", token, sub] => login(&mut settings, token, sub),
        ["keys"] => keys(&settings).await,
        ["sync", uid, jwt] => sync(&settings, uid, jwt).await,
        ["voice-note", uid, jwt] => voice_note(&settings, uid, jwt, None).await,
        ["voice-note", uid, jwt, out] => voice_note(&settings, uid, jwt, Some(*out)).await,
        ["record", seconds] => record(&settings, seconds).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };
    if let Err(e) = result {
        eprintln!("[voicejournal] {}", e);
        std::process::exit(1);
    }
}
