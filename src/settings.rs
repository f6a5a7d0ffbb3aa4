use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    /// Sent as `platform` on every journal request.
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Identity token for the logged in user; empty means logged out.
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub user_sub: String,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default = "default_entry_cache_max_stale")]
    pub entry_cache_max_stale: usize,
}

/// Timeouts and retry budget for the journal chat websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_retry_window_secs")]
    pub retry_window_secs: u64,
    #[serde(default = "default_max_retries_in_window")]
    pub max_retries_in_window: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl ChatSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_timeout_ms(),
            auth_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            retry_window_secs: default_retry_window_secs(),
            max_retries_in_window: default_max_retries_in_window(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: default_ws_base_url(),
            platform: default_platform(),
            id_token: String::new(),
            user_sub: String::new(),
            chat: ChatSettings::default(),
            entry_cache_max_stale: default_entry_cache_max_stale(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://oseh.io".into()
}
fn default_ws_base_url() -> String {
    "wss://oseh.io".into()
}
fn default_platform() -> String {
    "desktop".into()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_retry_window_secs() -> u64 {
    300
}
fn default_max_retries_in_window() -> usize {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_entry_cache_max_stale() -> usize {
    100
}

/// Directory holding settings and the stored journal client key.
pub fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("VoiceJournal"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".voicejournal"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn load() -> Settings {
    let mut settings = match settings_path() {
        Ok(path) => match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Settings::default(),
        },
        Err(_) => Settings::default(),
    };
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("VOICEJOURNAL_API").filter(|v| !v.is_empty()) {
        settings.api_base_url = v;
    }
    if let Some(v) = var("VOICEJOURNAL_WS").filter(|v| !v.is_empty()) {
        settings.ws_base_url = v;
    }
    if let Some(v) = var("VOICEJOURNAL_TOKEN").filter(|v| !v.is_empty()) {
        settings.id_token = v;
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(&path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
