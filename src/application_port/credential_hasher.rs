#[derive(Debug, thiserror::Error)]
#[error("hash error: {0}")]
pub struct HashError(pub String);

#[async_trait::async_trait]
pub trait CredentialHasher: Send + Sync {
    async fn hash_password(&self, password: &str) -> Result<String, HashError>;
    async fn verify_password(&self, password: &str, password_hash: &str)
    -> Result<bool, HashError>;
}
