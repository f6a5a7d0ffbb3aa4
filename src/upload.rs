//! Multipart file uploads against the file upload endpoint. The server hands
//! out a descriptor listing the parts it expects; each part is posted on its
//! own, a few at a time, and retried independently.

use crate::api::{ApiClient, ApiError};
use crate::task::CancelableTask;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One part as the server describes it: either a lone part or a run of
/// equally sized consecutive parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartDescriptor {
    Single {
        number: u32,
        start_byte: u64,
        end_byte: u64,
    },
    Range {
        start_number: u32,
        start_byte: u64,
        number_of_parts: u32,
        part_size: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    pub number: u32,
    /// Inclusive.
    pub start_byte: u64,
    /// Exclusive.
    pub end_byte: u64,
}

impl PartDescriptor {
    pub fn parts(&self) -> Vec<UploadPart> {
        match *self {
            PartDescriptor::Single {
                number,
                start_byte,
                end_byte,
            } => vec![UploadPart {
                number,
                start_byte,
                end_byte,
            }],
            PartDescriptor::Range {
                start_number,
                start_byte,
                number_of_parts,
                part_size,
            } => (0..number_of_parts)
                .map(|i| {
                    let start = start_byte + u64::from(i) * part_size;
                    UploadPart {
                        number: start_number + i,
                        start_byte: start,
                        end_byte: start + part_size,
                    }
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadDescriptor {
    pub uid: String,
    pub jwt: String,
    pub parts: Vec<PartDescriptor>,
}

impl FileUploadDescriptor {
    /// Every part, in ascending order by number.
    pub fn expanded_parts(&self) -> Vec<UploadPart> {
        let mut parts: Vec<UploadPart> = self.parts.iter().flat_map(|p| p.parts()).collect();
        parts.sort_by_key(|p| p.number);
        parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Running,
    Success,
    Failed(String),
    Canceled,
}

impl UploadStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, UploadStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Parts in flight at once.
    pub concurrency: usize,
    /// Retries per part before the whole upload fails.
    pub max_retries: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_retries: 5,
        }
    }
}

/// How a single part attempt went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    Uploaded,
    Retryable { min_delay: Duration },
    Fatal(String),
}

/// Where part bytes go. The HTTP implementation posts to the file upload
/// endpoint; tests substitute their own.
#[async_trait]
pub trait PartSink: Send + Sync {
    async fn upload_part(&self, number: u32, data: Vec<u8>) -> PartOutcome;
}

pub struct HttpPartSink {
    api: Arc<ApiClient>,
    uid: String,
    jwt: String,
}

impl HttpPartSink {
    pub fn new(api: Arc<ApiClient>, descriptor: &FileUploadDescriptor) -> Self {
        Self {
            api,
            uid: descriptor.uid.clone(),
            jwt: descriptor.jwt.clone(),
        }
    }
}

fn classify(result: Result<(), ApiError>) -> PartOutcome {
    match result {
        Ok(()) => PartOutcome::Uploaded,
        Err(ApiError::Network(_)) => PartOutcome::Retryable {
            min_delay: Duration::ZERO,
        },
        Err(e) => {
            if let Some(ms) = e.retry_after_ms().filter(|ms| *ms > 0) {
                return PartOutcome::Retryable {
                    min_delay: Duration::from_millis(ms),
                };
            }
            match e.status() {
                Some(429 | 502 | 503 | 504) => PartOutcome::Retryable {
                    min_delay: Duration::ZERO,
                },
                _ => PartOutcome::Fatal(e.to_string()),
            }
        }
    }
}

#[async_trait]
impl PartSink for HttpPartSink {
    async fn upload_part(&self, number: u32, data: Vec<u8>) -> PartOutcome {
        let path = format!("/api/1/file_uploads/{}/{}", self.uid, number);
        let part = match reqwest::multipart::Part::bytes(data)
            .file_name("file")
            .mime_str("application/octet-stream")
        {
            Ok(p) => p,
            Err(e) => return PartOutcome::Fatal(format!("Failed to build part: {}", e)),
        };
        let form = reqwest::multipart::Form::new().part("file", part);
        classify(self.api.post_multipart(&path, form, Some(&self.jwt)).await)
    }
}

fn backoff(retry: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..1000);
    Duration::from_millis((1u64 << retry.min(16)) * 1000 + jitter)
}

async fn upload_part_with_retries(
    sink: Arc<dyn PartSink>,
    data: Arc<Vec<u8>>,
    part: UploadPart,
    max_retries: u32,
) -> Result<(), String> {
    let len = data.len() as u64;
    if part.start_byte > part.end_byte || part.end_byte > len {
        return Err(format!(
            "part {} spans {}..{} but only {} bytes are available",
            part.number, part.start_byte, part.end_byte, len
        ));
    }
    let bytes = data[part.start_byte as usize..part.end_byte as usize].to_vec();
    let mut retries = 0u32;
    loop {
        match sink.upload_part(part.number, bytes.clone()).await {
            PartOutcome::Uploaded => {
                log::debug!("[upload] part {} done", part.number);
                return Ok(());
            }
            PartOutcome::Fatal(e) => return Err(format!("part {}: {}", part.number, e)),
            PartOutcome::Retryable { min_delay } => {
                if retries >= max_retries {
                    return Err(format!("part {}: too many retries", part.number));
                }
                let delay = backoff(retries).max(min_delay);
                retries += 1;
                log::debug!("[upload] part {} retry {} in {:?}", part.number, retries, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A running upload. The status leaves `Running` exactly once.
pub struct UploadJob {
    status: watch::Receiver<UploadStatus>,
    progress: watch::Receiver<(usize, usize)>,
    task: CancelableTask<()>,
}

impl UploadJob {
    pub fn start(sink: Arc<dyn PartSink>, data: Vec<u8>, parts: Vec<UploadPart>, opts: UploadOptions) -> Self {
        let (status_tx, status) = watch::channel(UploadStatus::Running);
        let total = parts.len();
        let (progress_tx, progress) = watch::channel((0usize, total));
        let data = Arc::new(data);
        let task = CancelableTask::spawn(move |token| async move {
            log::info!("[upload] {} parts, {} bytes", total, data.len());
            let mut pending = stream::iter(parts.into_iter().map(|part| {
                upload_part_with_retries(sink.clone(), data.clone(), part, opts.max_retries)
            }))
            .buffer_unordered(opts.concurrency.max(1));

            let mut finished = 0usize;
            let outcome = loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break UploadStatus::Canceled,
                    next = pending.next() => next,
                };
                match next {
                    None => break UploadStatus::Success,
                    Some(Ok(())) => {
                        finished += 1;
                        progress_tx.send_replace((finished, total));
                    }
                    Some(Err(e)) => {
                        log::warn!("[upload] failed: {}", e);
                        break UploadStatus::Failed(e);
                    }
                }
            };
            drop(pending);
            log::info!("[upload] finished: {:?}", outcome);
            status_tx.send_replace(outcome);
        });
        Self {
            status,
            progress,
            task,
        }
    }

    /// Starts uploading `data` to the upload the server described.
    pub fn start_http(api: Arc<ApiClient>, descriptor: &FileUploadDescriptor, data: Vec<u8>) -> Self {
        let sink = Arc::new(HttpPartSink::new(api, descriptor));
        Self::start(sink, data, descriptor.expanded_parts(), UploadOptions::default())
    }

    pub fn status(&self) -> watch::Receiver<UploadStatus> {
        self.status.clone()
    }

    /// Parts finished and parts total.
    pub fn progress(&self) -> watch::Receiver<(usize, usize)> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Waits until the upload is no longer running.
    pub async fn finished(&self) -> UploadStatus {
        let mut status = self.status.clone();
        let settled = match status.wait_for(|s| !s.is_running()).await {
            Ok(s) => s.clone(),
            Err(_) => UploadStatus::Canceled,
        };
        settled
    }

    /// Cancels if still running and waits for the worker to stop.
    pub async fn release(self) -> UploadStatus {
        let _ = self.task.release().await;
        let status = self.status.borrow().clone();
        if status.is_running() {
            UploadStatus::Canceled
        } else {
            status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct FakeSink {
        /// Outcomes to return per part before succeeding.
        script: Mutex<HashMap<u32, Vec<PartOutcome>>>,
        received: Mutex<Vec<(u32, Vec<u8>)>>,
        hang: bool,
    }

    #[async_trait]
    impl PartSink for FakeSink {
        async fn upload_part(&self, number: u32, data: Vec<u8>) -> PartOutcome {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let scripted = self
                .script
                .lock()
                .unwrap()
                .get_mut(&number)
                .and_then(|s| if s.is_empty() { None } else { Some(s.remove(0)) });
            if let Some(outcome) = scripted {
                return outcome;
            }
            self.received.lock().unwrap().push((number, data));
            PartOutcome::Uploaded
        }
    }

    fn descriptor(parts: serde_json::Value) -> FileUploadDescriptor {
        serde_json::from_value(serde_json::json!({"uid": "fu", "jwt": "j", "parts": parts})).unwrap()
    }

    #[test]
    fn descriptor_expands_single_and_range_parts() {
        let d = descriptor(serde_json::json!([
            {"start_number": 1, "start_byte": 0, "number_of_parts": 2, "part_size": 4},
            {"number": 3, "start_byte": 8, "end_byte": 10}
        ]));
        let parts = d.expanded_parts();
        assert_eq!(
            parts,
            vec![
                UploadPart { number: 1, start_byte: 0, end_byte: 4 },
                UploadPart { number: 2, start_byte: 4, end_byte: 8 },
                UploadPart { number: 3, start_byte: 8, end_byte: 10 },
            ]
        );
    }

    #[tokio::test]
    async fn uploads_every_part_with_its_bytes() {
        let sink = Arc::new(FakeSink::default());
        let data: Vec<u8> = (0..10).collect();
        let parts = descriptor(serde_json::json!([
            {"start_number": 1, "start_byte": 0, "number_of_parts": 2, "part_size": 4},
            {"number": 3, "start_byte": 8, "end_byte": 10}
        ]))
        .expanded_parts();
        let job = UploadJob::start(sink.clone(), data, parts, UploadOptions::default());
        assert_eq!(job.finished().await, UploadStatus::Success);
        assert_eq!(*job.progress().borrow(), (3, 3));
        let mut received = sink.received.lock().unwrap().clone();
        received.sort();
        assert_eq!(received[2], (3, vec![8, 9]));
        assert_eq!(received[0], (1, vec![0, 1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_part_is_retried_with_backoff() {
        let sink = Arc::new(FakeSink::default());
        sink.script.lock().unwrap().insert(
            1,
            vec![
                PartOutcome::Retryable { min_delay: Duration::ZERO },
                PartOutcome::Retryable { min_delay: Duration::from_secs(30) },
            ],
        );
        let started = Instant::now();
        let parts = vec![UploadPart { number: 1, start_byte: 0, end_byte: 2 }];
        let job = UploadJob::start(sink.clone(), vec![1, 2], parts, UploadOptions::default());
        assert_eq!(job.finished().await, UploadStatus::Success);
        // 1s..2s for the first retry, then the server's 30s floor.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(31) && elapsed < Duration::from_secs(32), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn part_fails_after_max_retries() {
        let sink = Arc::new(FakeSink::default());
        sink.script.lock().unwrap().insert(
            2,
            vec![PartOutcome::Retryable { min_delay: Duration::ZERO }; 3],
        );
        let parts = vec![
            UploadPart { number: 1, start_byte: 0, end_byte: 1 },
            UploadPart { number: 2, start_byte: 1, end_byte: 2 },
        ];
        let opts = UploadOptions { concurrency: 5, max_retries: 2 };
        let job = UploadJob::start(sink, vec![0, 0], parts, opts);
        assert!(matches!(job.finished().await, UploadStatus::Failed(e) if e.contains("too many retries")));
    }

    #[tokio::test]
    async fn fatal_part_fails_upload() {
        let sink = Arc::new(FakeSink::default());
        sink.script
            .lock()
            .unwrap()
            .insert(1, vec![PartOutcome::Fatal("server responded 403".into())]);
        let parts = vec![UploadPart { number: 1, start_byte: 0, end_byte: 1 }];
        let job = UploadJob::start(sink, vec![0], parts, UploadOptions::default());
        assert!(matches!(job.finished().await, UploadStatus::Failed(e) if e.contains("403")));
    }

    #[tokio::test]
    async fn release_cancels_in_flight_upload() {
        let sink = Arc::new(FakeSink {
            hang: true,
            ..Default::default()
        });
        let parts = vec![UploadPart { number: 1, start_byte: 0, end_byte: 1 }];
        let job = UploadJob::start(sink, vec![0], parts, UploadOptions::default());
        let status = job.status();
        assert_eq!(job.release().await, UploadStatus::Canceled);
        assert_eq!(*status.borrow(), UploadStatus::Canceled);
    }

    #[test]
    fn rate_limits_and_gateway_errors_are_retryable() {
        let status = |s, retry_after_ms| {
            classify(Err(ApiError::Status {
                status: s,
                body: String::new(),
                retry_after_ms,
            }))
        };
        assert_eq!(status(429, None), PartOutcome::Retryable { min_delay: Duration::ZERO });
        assert_eq!(
            status(500, Some(7000)),
            PartOutcome::Retryable { min_delay: Duration::from_secs(7) }
        );
        assert!(matches!(status(500, None), PartOutcome::Fatal(_)));
        assert!(matches!(status(400, None), PartOutcome::Fatal(_)));
    }
}
