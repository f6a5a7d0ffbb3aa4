use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mailbox closed")]
pub struct MailboxClosed;

struct Envelope<M> {
    msg: M,
    taken: oneshot::Sender<()>,
}

/// Single-slot rendezvous channel. At most one message waits in the slot; a
/// sender completes only once a receiver has actually taken its message.
pub fn mailbox<M>() -> (MailboxSender<M>, MailboxReceiver<M>) {
    let (tx, rx) = mpsc::channel(1);
    (MailboxSender { tx }, MailboxReceiver { rx })
}

pub struct MailboxSender<M> {
    tx: mpsc::Sender<Envelope<M>>,
}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> MailboxSender<M> {
    /// Waits for the slot, deposits `msg`, then waits for it to be received.
    /// Fails if the receiving side closed before taking it.
    pub async fn send(&self, msg: M) -> Result<(), MailboxClosed> {
        let (taken_tx, taken_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                msg,
                taken: taken_tx,
            })
            .await
            .map_err(|_| MailboxClosed)?;
        taken_rx.await.map_err(|_| MailboxClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct MailboxReceiver<M> {
    rx: mpsc::Receiver<Envelope<M>>,
}

impl<M> MailboxReceiver<M> {
    /// Cancel safe: if this future is dropped before completing, any message
    /// in the slot stays there for the next receive.
    pub async fn recv(&mut self) -> Option<M> {
        let envelope = self.rx.recv().await?;
        let _ = envelope.taken.send(());
        Some(envelope.msg)
    }

    /// Refuses further messages. A message already in the slot is dropped
    /// along with its sender's acknowledgement.
    pub fn close(&mut self) {
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            drop(envelope);
        }
    }
}
