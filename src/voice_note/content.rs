//! Remote audio for voice notes: the content file playlist and the selected
//! export's bytes, each held as a releasable request.

use crate::api::{spawn_fetch, ApiError, RetryPolicy};
use crate::task::TaskHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFileRef {
    pub uid: String,
    pub jwt: String,
}

impl ContentFileRef {
    pub fn playlist_path(&self) -> String {
        format!("/api/1/content_files/{}/web.json?presign=0", self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentExport {
    pub url: String,
    pub format: String,
    pub bandwidth: u64,
    #[serde(default)]
    pub codecs: Vec<String>,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPlaylist {
    pub exports: Vec<ContentExport>,
    pub duration_seconds: f64,
}

/// The highest bandwidth mp4 export, if there is one.
pub fn select_audio_target(playlist: &ContentPlaylist) -> Option<&ContentExport> {
    playlist
        .exports
        .iter()
        .filter(|e| e.format == "mp4")
        .fold(None, |best: Option<&ContentExport>, e| match best {
            Some(b) if b.bandwidth >= e.bandwidth => Some(b),
            _ => Some(e),
        })
}

/// Downloaded audio ready to hand to a player.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub bytes: Arc<Vec<u8>>,
    pub mime: String,
}

#[derive(Debug, PartialEq)]
pub enum RequestData<T> {
    Loading,
    Success(Arc<T>),
    Error(String),
    Released,
}

impl<T> RequestData<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, RequestData::Loading)
    }
}

/// A fetch whose result is published on a watch cell. Releasing cancels the
/// fetch if it is still going and pins the cell to `Released`.
pub struct ResourceRequest<T> {
    label: &'static str,
    data: Arc<watch::Sender<RequestData<T>>>,
    handle: TaskHandle,
}

impl<T: Send + Sync + 'static> ResourceRequest<T> {
    pub fn spawn<F, Fut>(policy: RetryPolicy, label: &'static str, attempt: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let (tx, _) = watch::channel(RequestData::Loading);
        let data = Arc::new(tx);
        let task = spawn_fetch(policy, label, attempt);
        let handle = task.handle();
        let writer = data.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(v)) => RequestData::Success(Arc::new(v)),
                Ok(Err(ApiError::Canceled)) => RequestData::Released,
                Ok(Err(e)) => RequestData::Error(e.to_string()),
                Err(e) => RequestData::Error(e.to_string()),
            };
            writer.send_if_modified(|d| {
                if d.is_loading() {
                    *d = outcome;
                    true
                } else {
                    false
                }
            });
        });
        Self { label, data, handle }
    }

    pub fn data(&self) -> watch::Receiver<RequestData<T>> {
        self.data.subscribe()
    }

    /// Waits for the request to leave `Loading`.
    pub async fn settled(&self) -> RequestData<T> {
        let mut rx = self.data.subscribe();
        let result = match rx.wait_for(|d| !d.is_loading()).await {
            Ok(d) => d.clone(),
            Err(_) => RequestData::Released,
        };
        result
    }

    /// Idempotent. Returns whether this call did the release.
    pub fn release(&self) -> bool {
        self.handle.cancel();
        let released = self.data.send_if_modified(|d| {
            if matches!(d, RequestData::Released) {
                false
            } else {
                *d = RequestData::Released;
                true
            }
        });
        if released {
            log::debug!("[voice-note] released {}", self.label);
        }
        released
    }
}

impl<T> Clone for RequestData<T> {
    fn clone(&self) -> Self {
        match self {
            RequestData::Loading => RequestData::Loading,
            RequestData::Success(v) => RequestData::Success(v.clone()),
            RequestData::Error(e) => RequestData::Error(e.clone()),
            RequestData::Released => RequestData::Released,
        }
    }
}
