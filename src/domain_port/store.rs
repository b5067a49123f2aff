use crate::domain_model::*;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Conflict,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("store error: {0}")]
    Backend(String),
}

/// Durable storage for users, channels, messages and refresh tokens.
///
/// Implementations must be safe to share across connections; every method may
/// be called concurrently from request handlers and persistence workers.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Inserts a password-less user row if none exists.
    async fn ensure_user(&self, user_id: &UserId) -> Result<(), StoreError>;
    async fn create_user(
        &self,
        user_id: &UserId,
        password: &str,
        display_name: &str,
    ) -> Result<User, StoreError>;
    async fn get_user(&self, user_id: &UserId) -> Result<User, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    /// Empty `display_name` or `password` leaves that field untouched.
    async fn update_user(
        &self,
        user_id: &UserId,
        display_name: &str,
        password: &str,
    ) -> Result<User, StoreError>;
    async fn delete_user(&self, user_id: &UserId) -> Result<(), StoreError>;
    async fn verify_user_password(
        &self,
        user_id: &UserId,
        password: &str,
    ) -> Result<User, StoreError>;

    /// Upserts a refresh token record as not revoked.
    async fn save_refresh_token(
        &self,
        user_id: &UserId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn get_refresh_token(&self, token: &str) -> Result<RefreshTokenRecord, StoreError>;
    /// `true` only when this call moved a live record to revoked.
    async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError>;

    async fn create_channel(&self, name: &str, created_by: &UserId)
    -> Result<Channel, StoreError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;
    async fn ensure_member(&self, channel_id: ChannelId, user_id: &UserId)
    -> Result<(), StoreError>;
    async fn save_channel_message(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        payload: &[u8],
    ) -> Result<ChannelMessage, StoreError>;
    /// Newest first, at most `limit` rows.
    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, StoreError>;
    /// Records a message published to a bare subject (no channel, no author).
    async fn save_message(&self, subject: &Subject, payload: &[u8]) -> Result<(), StoreError>;

    /// Releases connections. Called once at shutdown.
    async fn close(&self) {}
}
