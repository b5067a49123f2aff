use crate::domain_model::Subject;
use crate::domain_port::*;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::server::RealtimeBridge;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

pub type SseBody = BoxStream<'static, Result<Bytes, Infallible>>;

pub const SSE_READY: &str = ": stream ready\n\n";
pub const SSE_HEARTBEAT: &str = ": heartbeat\n\n";

/// One SSE event: a `data:` line per newline-separated segment, then a blank line.
pub fn format_sse_data(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut frame = String::with_capacity(text.len() + 8);
    for line in text.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

impl RealtimeBridge {
    /// Subscribes to `subject` and returns the event-stream body. The stream
    /// ends when the subscription closes, the bridge shuts down or the
    /// consumer drops it.
    pub async fn sse_stream(
        &self,
        subject: Subject,
    ) -> Result<SseBody, BusError> {
        let mut subscription = self
            .bus
            .subscribe(&subject, self.config.sse_buffer)
            .await?;

        let conn_id = Uuid::new_v4();
        let heartbeat = self.config.sse_heartbeat;
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel::<Bytes>(1);

        tokio::spawn(async move {
            let _guard = ConnectionMetricsGuard::new("sse");
            tracing::info!(%conn_id, %subject, "sse connected");
            if tx.send(Bytes::from_static(SSE_READY.as_bytes())).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => Bytes::from_static(SSE_HEARTBEAT.as_bytes()),
                    payload = subscription.recv() => match payload {
                        Some(payload) => {
                            metrics::record_message("outbound");
                            Bytes::from(format_sse_data(&payload))
                        }
                        None => break,
                    },
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            subscription.unsubscribe();
            tracing::info!(%conn_id, "sse disconnected");
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::PersistencePool;
    use crate::infra_memory::MemoryBus;
    use crate::server::BridgeConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn bridge(bus: Arc<MemoryBus>, config: BridgeConfig) -> RealtimeBridge {
        RealtimeBridge::new(bus, None, None, Arc::new(PersistencePool::new(4)), config)
    }

    async fn next_frame(stream: &mut SseBody) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        String::from_utf8(frame.to_vec()).unwrap()
    }

    #[test]
    fn test_format_sse_data() {
        assert_eq!(format_sse_data(b"hi"), "data: hi\n\n");
        assert_eq!(format_sse_data(b"hi\nthere"), "data: hi\ndata: there\n\n");
        assert_eq!(format_sse_data(b""), "data: \n\n");
    }

    #[tokio::test]
    async fn test_multiline_message_split_into_data_lines() {
        let bus = Arc::new(MemoryBus::new());
        let bridge = bridge(bus.clone(), BridgeConfig::default());
        let subject: Subject = "feed".parse().unwrap();

        let mut stream = bridge.sse_stream(subject.clone()).await.unwrap();
        assert_eq!(next_frame(&mut stream).await, SSE_READY);

        bus.publish(&subject, Bytes::from_static(b"hi\nthere"))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut stream).await, "data: hi\ndata: there\n\n");
    }

    #[tokio::test]
    async fn test_heartbeat_comment() {
        let bus = Arc::new(MemoryBus::new());
        let config = BridgeConfig {
            sse_heartbeat: Duration::from_millis(20),
            ..BridgeConfig::default()
        };
        let bridge = bridge(bus, config);

        let mut stream = bridge.sse_stream(Subject::default()).await.unwrap();
        assert_eq!(next_frame(&mut stream).await, SSE_READY);
        assert_eq!(next_frame(&mut stream).await, SSE_HEARTBEAT);
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let bus = Arc::new(MemoryBus::new());
        bus.set_connected(false);
        let bridge = bridge(bus, BridgeConfig::default());
        assert!(bridge.sse_stream(Subject::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let bus = Arc::new(MemoryBus::new());
        let bridge = bridge(bus.clone(), BridgeConfig::default());

        let stream = bridge.sse_stream(Subject::default()).await.unwrap();
        assert_eq!(bus.subscriber_count(crate::domain_model::DEFAULT_SUBJECT), 1);
        drop(stream);

        for _ in 0..100 {
            if bus.subscriber_count(crate::domain_model::DEFAULT_SUBJECT) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription still registered");
    }
}
