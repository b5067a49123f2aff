use crate::domain_model::Subject;
use bytes::Bytes;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("connect failed: {0}")]
    Connect(String),
}

/// Publish/subscribe message bus.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<(), BusError>;

    /// Subscribes with a receive buffer of `capacity` messages. Messages that
    /// arrive while the buffer is full are dropped by the adapter.
    async fn subscribe(&self, subject: &Subject, capacity: usize)
    -> Result<Subscription, BusError>;

    fn is_connected(&self) -> bool;
}

/// A live subscription. Dropping it (or calling `unsubscribe`) detaches it
/// from the bus; the adapter observes `cancelled()` and releases its side.
pub struct Subscription {
    receiver: Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(receiver: Receiver<Bytes>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
