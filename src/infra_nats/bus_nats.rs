use crate::domain_model::Subject;
use crate::domain_port::*;
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub name: String,
    pub connect_timeout_secs: u64,
}

/// Core NATS publish/subscribe. No JetStream: the bus is not durable.
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub async fn connect(config: &NatsConfig) -> Result<Self, BusError> {
        let options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
            .ping_interval(Duration::from_secs(20));

        let client = async_nats::connect_with_options(config.url.as_str(), options)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        tracing::info!(url = %config.url, "connected to nats");
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.as_str().to_owned(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        subject: &Subject,
        capacity: usize,
    ) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.as_str().to_owned())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let subject = subject.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    msg = subscriber.next() => match msg {
                        Some(msg) => match tx.try_send(msg.payload) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                tracing::warn!(%subject, "slow consumer, message dropped");
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                        None => break,
                    },
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                tracing::debug!(%subject, "unsubscribe failed: {}", e);
            }
        });

        Ok(Subscription::new(rx, cancel))
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}
