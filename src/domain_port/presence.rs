#[derive(Debug, thiserror::Error)]
#[error("presence error: {0}")]
pub struct PresenceError(pub String);

/// Shared counter of live connections per key.
#[async_trait::async_trait]
pub trait Presence: Send + Sync {
    async fn incr(&self, key: &str) -> Result<(), PresenceError>;
    async fn decr(&self, key: &str) -> Result<(), PresenceError>;
}
