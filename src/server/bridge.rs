//! Relays messages between client sockets and bus subjects.
//!
//! A WebSocket connection runs two pumps. The outbound pump forwards bus
//! messages and keepalive pings to the client; the inbound pump reads client
//! frames and publishes them. Both observe one per-connection cancellation
//! token, and teardown runs once after both have stopped.

use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::server::*;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub ws_buffer: usize,
    pub sse_heartbeat: Duration,
    pub sse_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(90),
            write_wait: Duration::from_secs(5),
            ws_buffer: 256,
            sse_heartbeat: Duration::from_secs(15),
            sse_buffer: 128,
        }
    }
}

pub struct RealtimeBridge {
    pub(super) bus: Arc<dyn MessageBus>,
    store: Option<Arc<dyn Store>>,
    presence: Option<Arc<dyn Presence>>,
    tasks: Arc<dyn TaskQueue>,
    pub(super) config: BridgeConfig,
    pub(super) shutdown: CancellationToken,
}

impl RealtimeBridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Option<Arc<dyn Store>>,
        presence: Option<Arc<dyn Presence>>,
        tasks: Arc<dyn TaskQueue>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            bus,
            store,
            presence,
            tasks,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ends every open connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn serve_ws(
        &self,
        mut sender: Box<dyn ConnSender>,
        receiver: Box<dyn ConnReceiver>,
        user_id: Option<UserId>,
        target: StreamTarget,
    ) {
        let conn_id = Uuid::new_v4();
        let subscription = match self
            .bus
            .subscribe(&target.subject, self.config.ws_buffer)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(%conn_id, subject = %target.subject, "ws subscribe failed: {}", e);
                let _ = sender
                    .send(ConnMessage::Text("subscribe failed".to_string()))
                    .await;
                let _ = sender.send(ConnMessage::Close).await;
                return;
            }
        };

        let _guard = ConnectionMetricsGuard::new("ws");
        let presence_key = self.join(&target, user_id.as_ref()).await;
        tracing::info!(%conn_id, subject = %target.subject, user_id = ?user_id, "ws connected");

        let cancel = self.shutdown.child_token();
        let outbound = tokio::spawn(outbound_pump(
            conn_id,
            sender,
            subscription,
            cancel.clone(),
            self.config.ping_interval,
            self.config.write_wait,
        ));
        self.inbound_pump(conn_id, receiver, &target, user_id.as_ref(), &cancel)
            .await;
        cancel.cancel();

        // teardown
        match outbound.await {
            Ok((mut sender, subscription)) => {
                subscription.unsubscribe();
                let _ = tokio::time::timeout(
                    self.config.write_wait,
                    sender.send(ConnMessage::Close),
                )
                .await;
            }
            Err(e) => tracing::error!(%conn_id, "ws outbound pump panicked: {e}"),
        }
        if let Some(key) = presence_key {
            self.leave(&key).await;
        }
        tracing::info!(%conn_id, "ws disconnected");
    }

    /// Counts a channel connection in presence and, when the caller is
    /// authenticated, records membership. Returns the presence key to
    /// release on teardown.
    async fn join(&self, target: &StreamTarget, user_id: Option<&UserId>) -> Option<String> {
        let channel_id = target.channel_id?;

        if let (Some(store), Some(user_id)) = (&self.store, user_id) {
            if let Err(e) = store.ensure_user(user_id).await {
                tracing::warn!(%user_id, "ensure user failed: {}", e);
            } else if let Err(e) = store.ensure_member(channel_id, user_id).await {
                tracing::warn!(%user_id, %channel_id, "ensure member failed: {}", e);
            }
        }

        let presence = self.presence.as_ref()?;
        let key = channel_id.presence_key();
        if let Err(e) = presence.incr(&key).await {
            tracing::warn!(key = %key, "presence incr failed: {}", e);
        }
        Some(key)
    }

    async fn leave(&self, key: &str) {
        if let Some(presence) = &self.presence {
            if let Err(e) = presence.decr(key).await {
                tracing::warn!(key = %key, "presence decr failed: {}", e);
            }
        }
    }

    async fn inbound_pump(
        &self,
        conn_id: Uuid,
        mut receiver: Box<dyn ConnReceiver>,
        target: &StreamTarget,
        user_id: Option<&UserId>,
        cancel: &CancellationToken,
    ) {
        let mut deadline = Instant::now() + self.config.pong_wait;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout_at(deadline, receiver.next()) => next,
            };
            let message = match next {
                Err(_) => {
                    tracing::debug!(%conn_id, "ws read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(%conn_id, "ws read failed: {}", e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let payload = match message {
                ConnMessage::Pong => {
                    deadline = Instant::now() + self.config.pong_wait;
                    continue;
                }
                ConnMessage::Ping => continue,
                ConnMessage::Close => break,
                ConnMessage::Text(text) => Bytes::from(text),
                ConnMessage::Binary(data) => Bytes::from(data),
            };
            if payload.is_empty() {
                continue;
            }
            self.relay(target, user_id, payload).await;
        }
        cancel.cancel();
    }

    /// Publishes one client frame and queues it for storage when a store is
    /// configured and the connection is channel-scoped and authenticated.
    async fn relay(&self, target: &StreamTarget, user_id: Option<&UserId>, payload: Bytes) {
        metrics::record_message("inbound");
        if let Err(e) = self.bus.publish(&target.subject, payload.clone()).await {
            tracing::warn!(subject = %target.subject, "publish failed: {}", e);
            metrics::record_publish_failure();
        }
        if let (Some(_), Some(channel_id), Some(user_id)) =
            (&self.store, target.channel_id, user_id)
        {
            self.tasks.submit(PersistTask::SaveMessage {
                channel_id,
                user_id: user_id.clone(),
                payload,
            });
        }
    }
}

/// Hands the sender and subscription back for teardown.
async fn outbound_pump(
    conn_id: Uuid,
    mut sender: Box<dyn ConnSender>,
    mut subscription: Subscription,
    cancel: CancellationToken,
    ping_interval: Duration,
    write_wait: Duration,
) -> (Box<dyn ConnSender>, Subscription) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => ConnMessage::Ping,
            payload = subscription.recv() => match payload {
                Some(payload) => {
                    metrics::record_message("outbound");
                    match std::str::from_utf8(&payload) {
                        Ok(text) => ConnMessage::Text(text.to_owned()),
                        Err(_) => ConnMessage::Binary(payload.to_vec()),
                    }
                }
                None => {
                    tracing::debug!(%conn_id, "subscription closed");
                    break;
                }
            },
        };
        match tokio::time::timeout(write_wait, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, "ws write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!(%conn_id, "ws write timed out");
                break;
            }
        }
    }
    cancel.cancel();
    (sender, subscription)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::PersistencePool;
    use crate::infra_memory::*;
    use tokio::sync::mpsc;

    struct Harness {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        presence: Arc<MemoryPresence>,
        pool: Arc<PersistencePool>,
        bridge: Arc<RealtimeBridge>,
    }

    fn harness(config: BridgeConfig) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new());
        let pool = Arc::new(PersistencePool::new(16));
        let bridge = Arc::new(RealtimeBridge::new(
            bus.clone(),
            Some(store.clone()),
            Some(presence.clone()),
            pool.clone(),
            config,
        ));
        Harness {
            bus,
            store,
            presence,
            pool,
            bridge,
        }
    }

    /// Starts `serve_ws` over in-memory channels. Returns the client's
    /// write side, its read side and the connection task.
    fn connect(
        bridge: Arc<RealtimeBridge>,
        user_id: Option<UserId>,
        target: StreamTarget,
    ) -> (
        mpsc::Sender<ConnMessage>,
        mpsc::Receiver<ConnMessage>,
        tokio::task::JoinHandle<()>,
    ) {
        let (client_tx, server_rx) = mpsc::channel::<ConnMessage>(16);
        let (server_tx, client_rx) = mpsc::channel::<ConnMessage>(16);
        let handle = tokio::spawn(async move {
            bridge
                .serve_ws(Box::new(server_tx), Box::new(server_rx), user_id, target)
                .await
        });
        (client_tx, client_rx, handle)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_channel_frame_reaches_bus_and_pool() {
        let h = harness(BridgeConfig::default());
        let alice = UserId::from("alice");
        let target = StreamTarget::resolve(None, Some("42")).unwrap();

        let (client_tx, _client_rx, handle) =
            connect(h.bridge.clone(), Some(alice.clone()), target.clone());
        wait_for(|| h.presence.count("channel:42") == 1).await;
        assert!(h.store.is_member(ChannelId(42), &alice));

        let mut observer = h.bus.subscribe(&target.subject, 8).await.unwrap();
        client_tx
            .send(ConnMessage::Text("hello".to_string()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], b"hello");

        drop(client_tx);
        handle.await.unwrap();
        assert_eq!(h.presence.count("channel:42"), 0);

        h.pool
            .start(CancellationToken::new(), h.store.clone(), 1);
        h.pool.shutdown().await;
        let saved = h.store.list_messages(ChannelId(42), 10).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].payload, "hello");
        assert_eq!(saved[0].user_id, alice);
    }

    #[tokio::test]
    async fn test_bus_messages_forwarded_as_text() {
        let h = harness(BridgeConfig::default());
        let target = StreamTarget::resolve(Some("news"), None).unwrap();

        let (client_tx, mut client_rx, handle) = connect(h.bridge.clone(), None, target.clone());
        wait_for(|| h.bus.subscriber_count("news") == 1).await;

        h.bus
            .publish(&target.subject, Bytes::from_static(b"breaking"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(ConnMessage::Text("breaking".to_string())));

        drop(client_tx);
        handle.await.unwrap();
        wait_for(|| h.bus.subscriber_count("news") == 0).await;
    }

    #[tokio::test]
    async fn test_anonymous_channel_frames_not_persisted() {
        let h = harness(BridgeConfig::default());
        let target = StreamTarget::resolve(None, Some("7")).unwrap();

        let (client_tx, _client_rx, handle) = connect(h.bridge.clone(), None, target);
        wait_for(|| h.bus.subscriber_count("channels.7") == 1).await;
        client_tx
            .send(ConnMessage::Text("anon".to_string()))
            .await
            .unwrap();
        drop(client_tx);
        handle.await.unwrap();

        assert_eq!(h.presence.count("channel:7"), 0);
        h.pool
            .start(CancellationToken::new(), h.store.clone(), 1);
        h.pool.shutdown().await;
        assert!(h.store.list_messages(ChannelId(7), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failure_sends_reason_then_closes() {
        let h = harness(BridgeConfig::default());
        h.bus.set_connected(false);
        let target = StreamTarget::resolve(None, Some("42")).unwrap();

        let (_client_tx, mut client_rx, handle) =
            connect(h.bridge.clone(), Some(UserId::from("alice")), target);
        handle.await.unwrap();

        assert_eq!(
            client_rx.recv().await,
            Some(ConnMessage::Text("subscribe failed".to_string()))
        );
        assert_eq!(client_rx.recv().await, Some(ConnMessage::Close));
        assert_eq!(h.presence.count("channel:42"), 0);
    }

    #[tokio::test]
    async fn test_missed_pong_tears_down_once() {
        let config = BridgeConfig {
            ping_interval: Duration::from_millis(20),
            pong_wait: Duration::from_millis(80),
            ..BridgeConfig::default()
        };
        let h = harness(config);
        let target = StreamTarget::resolve(None, Some("9")).unwrap();

        let (_client_tx, mut client_rx, handle) =
            connect(h.bridge.clone(), Some(UserId::from("bob")), target);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = client_rx.try_recv() {
            frames.push(frame);
        }
        assert!(frames.contains(&ConnMessage::Ping));
        assert_eq!(frames.last(), Some(&ConnMessage::Close));
        assert_eq!(h.presence.count("channel:9"), 0);
        wait_for(|| h.bus.subscriber_count("channels.9") == 0).await;
    }

    #[tokio::test]
    async fn test_pong_extends_deadline() {
        let config = BridgeConfig {
            ping_interval: Duration::from_millis(20),
            pong_wait: Duration::from_millis(100),
            ..BridgeConfig::default()
        };
        let h = harness(config);
        let target = StreamTarget::resolve(Some("alive"), None).unwrap();

        let (client_tx, _client_rx, handle) = connect(h.bridge.clone(), None, target);
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            client_tx.send(ConnMessage::Pong).await.unwrap();
        }
        assert!(!handle.is_finished());

        h.bridge.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[derive(Default)]
    struct RecordingQueue {
        tasks: std::sync::Mutex<Vec<PersistTask>>,
    }

    impl TaskQueue for RecordingQueue {
        fn submit(&self, task: PersistTask) -> bool {
            self.tasks.lock().unwrap().push(task);
            true
        }
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_connection_open() {
        let h = harness(BridgeConfig::default());
        let target = StreamTarget::resolve(Some("flaky"), None).unwrap();
        let mut observer = h.bus.subscribe(&target.subject, 8).await.unwrap();

        let (client_tx, _client_rx, handle) = connect(h.bridge.clone(), None, target);
        wait_for(|| h.bus.subscriber_count("flaky") == 2).await;

        h.bus.set_connected(false);
        for text in ["first", "second"] {
            client_tx
                .send(ConnMessage::Text(text.to_string()))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        h.bus.set_connected(true);
        client_tx
            .send(ConnMessage::Text("third".to_string()))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], b"third");

        drop(client_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_without_store_frames_not_queued() {
        let bus = Arc::new(MemoryBus::new());
        let queue = Arc::new(RecordingQueue::default());
        let bridge = Arc::new(RealtimeBridge::new(
            bus.clone(),
            None,
            None,
            queue.clone(),
            BridgeConfig::default(),
        ));
        let target = StreamTarget::resolve(None, Some("3")).unwrap();
        let mut observer = bus.subscribe(&target.subject, 8).await.unwrap();

        let (client_tx, _client_rx, handle) =
            connect(bridge, Some(UserId::from("alice")), target);
        client_tx
            .send(ConnMessage::Text("hi".to_string()))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], b"hi");

        drop(client_tx);
        handle.await.unwrap();
        assert!(queue.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_channel_connection_counted_in_presence() {
        let h = harness(BridgeConfig::default());
        let target = StreamTarget::resolve(None, Some("5")).unwrap();

        let (client_tx, _client_rx, handle) = connect(h.bridge.clone(), None, target);
        wait_for(|| h.presence.count("channel:5") == 1).await;
        assert!(h.store.list_users().await.unwrap().is_empty());

        drop(client_tx);
        handle.await.unwrap();
        assert_eq!(h.presence.count("channel:5"), 0);
    }

    #[tokio::test]
    async fn test_non_utf8_payload_forwarded_as_binary() {
        let h = harness(BridgeConfig::default());
        let target = StreamTarget::resolve(Some("raw"), None).unwrap();

        let (client_tx, mut client_rx, handle) = connect(h.bridge.clone(), None, target.clone());
        wait_for(|| h.bus.subscriber_count("raw") == 1).await;

        h.bus
            .publish(&target.subject, Bytes::from_static(&[0xff, 0xfe, 0x00]))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(ConnMessage::Binary(vec![0xff, 0xfe, 0x00])));

        drop(client_tx);
        handle.await.unwrap();
    }
}
