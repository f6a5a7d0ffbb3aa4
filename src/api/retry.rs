use super::ApiError;
use crate::task::CancelableTask;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How a fetch reacts to retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,
    /// `1000 * 2^n + rand(1000)` ms before retry `n`; at most three attempts.
    ExpoBackoff3,
    /// Retries forever about every five seconds. For endpoints that hold the
    /// request open while the server works.
    Forever5,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), or `None` to give up.
    /// A server supplied `Retry-After` only ever lengthens the delay.
    pub fn delay_for(&self, retry: u32, retry_after_ms: Option<u64>) -> Option<Duration> {
        let mut rng = rand::thread_rng();
        let ms = match self {
            RetryPolicy::Never => return None,
            RetryPolicy::ExpoBackoff3 => {
                if retry >= 3 {
                    return None;
                }
                1000u64 * (1u64 << retry) + rng.gen_range(0..1000)
            }
            RetryPolicy::Forever5 => 4500 + rng.gen_range(0..1000),
        };
        Some(Duration::from_millis(ms.max(retry_after_ms.unwrap_or(0))))
    }
}

pub type FetchTask<T> = CancelableTask<Result<T, ApiError>>;

/// Runs `attempt` under `policy` as a cancelable task. Cancellation settles the
/// task with `ApiError::Canceled`, interrupting either the request or the
/// backoff sleep.
pub fn spawn_fetch<T, F, Fut>(policy: RetryPolicy, label: &'static str, mut attempt: F) -> FetchTask<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    CancelableTask::spawn(move |token| async move {
        let mut retries = 0u32;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(ApiError::Canceled),
                r = attempt() => r,
            };
            let err = match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            retries += 1;
            let Some(delay) = policy.delay_for(retries, err.retry_after_ms()) else {
                log::warn!("[api] {} giving up after {} attempts: {}", label, retries, err);
                return Err(err);
            };
            log::debug!("[api] {} failed ({}), retry {} in {:?}", label, err, retries, delay);
            tokio::select! {
                _ = token.cancelled() => return Err(ApiError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}
