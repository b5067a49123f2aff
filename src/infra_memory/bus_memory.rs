use crate::domain_model::Subject;
use crate::domain_port::*;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

type Registry = Arc<Mutex<HashMap<String, Vec<(u64, Sender<Bytes>)>>>>;

/// In-process bus with exact-match subjects. Delivery is at-most-once: a
/// subscriber whose buffer is full misses the message.
pub struct MemoryBus {
    registry: Registry,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }
    }

    /// A disconnected bus refuses every publish and subscribe.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(registry: &Registry, subject: &str, id: u64) {
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = registry.get_mut(subject) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                registry.remove(subject);
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Publish("not connected".to_string()));
        }
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = registry.get_mut(subject.as_str()) {
            subs.retain(|(id, tx)| match tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subject = %subject, sub_id = id, "slow subscriber, message dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &Subject,
        capacity: usize,
    ) -> Result<Subscription, BusError> {
        if !self.is_connected() {
            return Err(BusError::Subscribe("not connected".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(subject.as_str().to_owned())
            .or_default()
            .push((id, tx));

        let cancel = CancellationToken::new();
        let registry = self.registry.clone();
        let key = subject.as_str().to_owned();
        let token = cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            Self::remove(&registry, &key, id);
        });

        Ok(Subscription::new(rx, cancel))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = MemoryBus::new();
        let subject: Subject = "room.1".parse().unwrap();
        let mut a = bus.subscribe(&subject, 4).await.unwrap();
        let mut b = bus.subscribe(&subject, 4).await.unwrap();

        bus.publish(&subject, Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_full_buffer_drops() {
        let bus = MemoryBus::new();
        let subject: Subject = "room.1".parse().unwrap();
        let mut sub = bus.subscribe(&subject, 1).await.unwrap();

        bus.publish(&subject, Bytes::from_static(b"1")).await.unwrap();
        bus.publish(&subject, Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"1"));
        let next = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_registration() {
        let bus = MemoryBus::new();
        let subject: Subject = "room.1".parse().unwrap();
        let sub = bus.subscribe(&subject, 1).await.unwrap();
        assert_eq!(bus.subscriber_count("room.1"), 1);

        sub.unsubscribe();
        for _ in 0..50 {
            if bus.subscriber_count("room.1") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(bus.subscriber_count("room.1"), 0);
    }

    #[tokio::test]
    async fn test_disconnected() {
        let bus = MemoryBus::new();
        bus.set_connected(false);
        let subject = Subject::default();

        assert!(bus.publish(&subject, Bytes::new()).await.is_err());
        assert!(bus.subscribe(&subject, 1).await.is_err());
    }
}
