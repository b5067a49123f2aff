use crate::domain_model::*;

/// Why a credential was refused. Callers collapse every variant except
/// `Unavailable` into one `Unauthorized` response; the variants exist for logs.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token invalid: {0}")]
    TokenInvalid(String),
    #[error("token expired")]
    TokenExpired,
    #[error("refresh token revoked or unknown")]
    TokenRevoked,
    #[error("store not configured")]
    Unavailable,
    #[error("internal error: {0}")]
    InternalError(String),
}

#[async_trait::async_trait]
pub trait SessionService: Send + Sync {
    /// Signs a fresh access/refresh pair and records the refresh half.
    async fn issue(&self, user_id: &UserId) -> Result<Session, AuthError>;

    fn validate_access(&self, token: &str) -> Result<UserId, AuthError>;

    /// Single-use exchange of a refresh token for a brand-new session.
    async fn rotate_refresh(&self, refresh_token: &str) -> Result<Session, AuthError>;

    /// Best-effort; unknown tokens are ignored.
    async fn revoke(&self, refresh_token: &str);
}
