use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task panicked")]
    Panicked,
    #[error("task aborted")]
    Aborted,
}

/// Cloneable view of a running task: enough to cancel it and to wait for it
/// to settle, without being able to take its output.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancellation was requested, whether or not the body noticed.
    pub fn is_finishing(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn settled(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|d| *d).await;
    }
}

/// A spawned body paired with a cancellation token. Cancelling only asks; the
/// body decides how to settle, and callers still await it afterwards.
pub struct CancelableTask<T> {
    handle: TaskHandle,
    join: JoinHandle<T>,
}

impl<T: Send + 'static> CancelableTask<T> {
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let fut = body(token.clone());
        let join = tokio::spawn(async move {
            let out = fut.await;
            done_tx.send_replace(true);
            out
        });
        Self {
            handle: TaskHandle {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                token,
                done: done_rx,
            },
            join,
        }
    }

    /// A task that has already produced `value`.
    pub fn ready(value: T) -> Self {
        Self::spawn(|_| async move { value })
    }
}

impl<T> CancelableTask<T> {
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Cancel, then wait for the body to settle.
    pub async fn release(self) -> Result<T, TaskError> {
        self.handle.cancel();
        self.await
    }
}

impl<T> Future for CancelableTask<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(v)),
            Poll::Ready(Err(e)) if e.is_panic() => Poll::Ready(Err(TaskError::Panicked)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Aborted)),
        }
    }
}
