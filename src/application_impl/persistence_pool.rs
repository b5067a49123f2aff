//! Bounded queue of deferred storage writes, drained by a fixed set of workers.
//!
//! Submission never waits: when the queue is full the task is dropped and
//! logged. Storage failures are logged and never retried.

use crate::application_port::*;
use crate::domain_port::*;
use crate::metrics;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct PersistencePool {
    sender: Sender<PersistTask>,
    receiver: Arc<tokio::sync::Mutex<Receiver<PersistTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    draining: CancellationToken,
}

impl PersistencePool {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            handles: Mutex::new(Vec::new()),
            draining: CancellationToken::new(),
        }
    }

    /// Spawns `workers` workers. Cancelling `cancel` stops them after their
    /// current task; whatever is still queued is dropped.
    pub fn start(&self, cancel: CancellationToken, store: Arc<dyn Store>, workers: usize) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..workers.max(1) {
            handles.push(tokio::spawn(worker(
                worker_id,
                self.receiver.clone(),
                store.clone(),
                cancel.clone(),
                self.draining.clone(),
            )));
        }
        tracing::info!(workers = handles.len(), "persistence pool started");
    }

    /// Stops accepting tasks, lets the workers finish what is queued, then
    /// waits for them.
    pub async fn shutdown(&self) {
        self.draining.cancel();
        let handles: Vec<_> = {
            let mut lock = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            lock.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("persistence worker panicked: {e}");
            }
        }
        tracing::info!("persistence pool stopped");
    }
}

impl TaskQueue for PersistencePool {
    fn submit(&self, task: PersistTask) -> bool {
        if self.draining.is_cancelled() {
            tracing::warn!(kind = task.kind(), "persistence pool closed, task dropped");
            metrics::record_persist("dropped");
            return false;
        }
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                tracing::warn!(kind = task.kind(), "persistence queue full, task dropped");
                metrics::record_persist("dropped");
                false
            }
            Err(TrySendError::Closed(task)) => {
                tracing::warn!(kind = task.kind(), "persistence queue closed, task dropped");
                metrics::record_persist("dropped");
                false
            }
        }
    }
}

async fn worker(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<Receiver<PersistTask>>>,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    draining: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = draining.cancelled() => match rx.try_recv() {
                    Ok(task) => task,
                    Err(_) => break,
                },
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };
        apply(worker_id, store.as_ref(), task).await;
    }
    tracing::debug!(worker_id, "persistence worker exiting");
}

async fn apply(worker_id: usize, store: &dyn Store, task: PersistTask) {
    let kind = task.kind();
    let result = match task {
        PersistTask::SaveMessage {
            channel_id,
            user_id,
            payload,
        } => store
            .save_channel_message(channel_id, &user_id, &payload)
            .await
            .map(|_| ()),
        PersistTask::SaveRefreshToken {
            user_id,
            token,
            expires_at,
        } => store.save_refresh_token(&user_id, &token, expires_at).await,
        PersistTask::SaveSubjectMessage { subject, payload } => {
            store.save_message(&subject, &payload).await
        }
    };
    match result {
        Ok(()) => {
            tracing::trace!(worker_id, kind, "persisted");
            metrics::record_persist("ok");
        }
        Err(e) => {
            tracing::warn!(worker_id, kind, "persist failed: {}", e);
            metrics::record_persist("failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_model::*;
    use crate::infra_memory::MemoryStore;
    use bytes::Bytes;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_tasks_applied_before_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let pool = PersistencePool::new(16);
        pool.start(CancellationToken::new(), store.clone(), 1);

        let alice = UserId::from("alice");
        let expires_at = Utc::now() + Duration::hours(1);
        assert!(pool.submit(PersistTask::SaveMessage {
            channel_id: ChannelId(42),
            user_id: alice.clone(),
            payload: Bytes::from_static(b"hello"),
        }));
        assert!(pool.submit(PersistTask::SaveRefreshToken {
            user_id: alice.clone(),
            token: "rt-1".to_string(),
            expires_at,
        }));

        pool.shutdown().await;

        let messages = store.list_messages(ChannelId(42), 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "hello");
        assert_eq!(messages[0].subject.as_str(), "channels.42");

        let record = store.get_refresh_token("rt-1").await.unwrap();
        assert_eq!(record.user_id, alice);
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_dropped() {
        let store = Arc::new(MemoryStore::new());
        let pool = PersistencePool::new(4);
        pool.start(CancellationToken::new(), store.clone(), 2);
        pool.shutdown().await;

        assert!(!pool.submit(PersistTask::SaveSubjectMessage {
            subject: Subject::default(),
            payload: Bytes::from_static(b"late"),
        }));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        // Not started: nothing drains the queue.
        let pool = PersistencePool::new(1);
        let task = PersistTask::SaveSubjectMessage {
            subject: Subject::default(),
            payload: Bytes::from_static(b"x"),
        };

        assert!(pool.submit(task.clone()));
        assert!(!pool.submit(task));
    }

    #[tokio::test]
    async fn test_cancel_drops_queued() {
        let store = Arc::new(MemoryStore::new());
        let pool = PersistencePool::new(8);
        for i in 0..4 {
            pool.submit(PersistTask::SaveSubjectMessage {
                subject: Subject::default(),
                payload: Bytes::from(format!("m{i}")),
            });
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        pool.start(cancel, store.clone(), 1);
        pool.shutdown().await;

        assert_eq!(store.subject_message_count(), 0);
    }
}
