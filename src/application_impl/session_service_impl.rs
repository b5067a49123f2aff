use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct JwtConfig {
    pub access_secret: Vec<u8>,
    pub refresh_secret: Vec<u8>,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    jti: String, // keeps same-second tokens distinct
}

fn sign(
    user_id: &UserId,
    secret: &[u8],
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>), AuthError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| AuthError::InternalError(e.to_string()))?;
    let exp_dt = now + ttl;
    let claims = Claims {
        sub: user_id.0.clone(),
        iat: now.timestamp(),
        exp: exp_dt.timestamp(),
        jti: uuid::Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::InternalError(e.to_string()))?;
    Ok((token, exp_dt))
}

fn verify(token: &str, secret: &[u8]) -> Result<Claims, AuthError> {
    let mut v = Validation::new(Algorithm::HS256);
    v.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
    v.leeway = 0;
    v.validate_exp = true;
    v.set_required_spec_claims(&["exp", "iat", "sub"]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &v).map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidAlgorithm => {
                AuthError::TokenInvalid("unexpected signing method".to_string())
            }
            ErrorKind::InvalidSignature => AuthError::TokenInvalid("bad signature".to_string()),
            _ => AuthError::TokenInvalid(e.to_string()),
        }
    })?;

    if data.claims.sub.is_empty() {
        return Err(AuthError::TokenInvalid("empty subject".to_string()));
    }
    Ok(data.claims)
}

pub struct JwtSessionService {
    cfg: JwtConfig,
    store: Option<Arc<dyn Store>>,
    deferred_writes: Option<Arc<dyn TaskQueue>>,
}

impl JwtSessionService {
    pub fn new(cfg: JwtConfig, store: Option<Arc<dyn Store>>) -> Self {
        Self {
            cfg,
            store,
            deferred_writes: None,
        }
    }

    /// Queue used when a refresh token cannot be written synchronously.
    pub fn with_deferred_writes(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.deferred_writes = Some(queue);
        self
    }

    async fn persist_refresh(&self, user_id: &UserId, token: &str, expires_at: DateTime<Utc>) {
        let Some(store) = &self.store else {
            return;
        };
        let Err(e) = store.save_refresh_token(user_id, token, expires_at).await else {
            return;
        };
        tracing::warn!(%user_id, "save refresh token failed: {}", e);
        if let Some(queue) = &self.deferred_writes {
            queue.submit(PersistTask::SaveRefreshToken {
                user_id: user_id.clone(),
                token: token.to_owned(),
                expires_at,
            });
        }
    }
}

#[async_trait::async_trait]
impl SessionService for JwtSessionService {
    async fn issue(&self, user_id: &UserId) -> Result<Session, AuthError> {
        let now = Utc::now();
        let (access_token, access_expires_at) =
            sign(user_id, &self.cfg.access_secret, self.cfg.access_ttl, now)?;
        let (refresh_token, refresh_expires_at) =
            sign(user_id, &self.cfg.refresh_secret, self.cfg.refresh_ttl, now)?;

        self.persist_refresh(user_id, &refresh_token, refresh_expires_at)
            .await;

        Ok(Session {
            user_id: user_id.clone(),
            access_token: AccessToken(access_token),
            access_expires_at,
            refresh_token: RefreshToken(refresh_token),
            refresh_expires_at,
        })
    }

    fn validate_access(&self, token: &str) -> Result<UserId, AuthError> {
        let claims = verify(token, &self.cfg.access_secret).inspect_err(|e| {
            tracing::debug!("access token rejected: {}", e);
        })?;
        Ok(UserId(claims.sub))
    }

    async fn rotate_refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let store = self.store.as_ref().ok_or(AuthError::Unavailable)?;

        let claims = verify(refresh_token, &self.cfg.refresh_secret).inspect_err(|e| {
            tracing::debug!("refresh token rejected: {}", e);
        })?;
        let user_id = UserId(claims.sub);

        let record = store
            .get_refresh_token(refresh_token)
            .await
            .map_err(|e| {
                tracing::debug!(%user_id, "refresh token lookup failed: {}", e);
                AuthError::TokenRevoked
            })?;
        if record.user_id != user_id {
            tracing::warn!(%user_id, owner = %record.user_id, "refresh token subject mismatch");
            return Err(AuthError::TokenInvalid("subject mismatch".to_string()));
        }
        if !record.is_usable(Utc::now()) {
            return Err(AuthError::TokenRevoked);
        }

        // Rotation: consume before issuing so a replay loses the race.
        match store.revoke_refresh_token(refresh_token).await {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::TokenRevoked),
            Err(e) => {
                tracing::warn!(%user_id, "revoke refresh token failed: {}", e);
                return Err(AuthError::TokenRevoked);
            }
        }

        self.issue(&user_id).await
    }

    async fn revoke(&self, refresh_token: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.revoke_refresh_token(refresh_token).await {
            tracing::warn!("revoke refresh token failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::MemoryStore;

    fn config() -> JwtConfig {
        JwtConfig {
            access_secret: b"access-secret".to_vec(),
            refresh_secret: b"refresh-secret".to_vec(),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(86400),
        }
    }

    fn service() -> (JwtSessionService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = JwtSessionService::new(config(), Some(store.clone()));
        (svc, store)
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let (svc, store) = service();
        let alice = UserId::from("alice");

        let session = svc.issue(&alice).await.unwrap();
        assert_eq!(svc.validate_access(&session.access_token.0).unwrap(), alice);
        assert!(session.access_expires_at < session.refresh_expires_at);

        let record = store
            .get_refresh_token(&session.refresh_token.0)
            .await
            .unwrap();
        assert_eq!(record.user_id, alice);
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn test_expired_access_rejected() {
        let (svc, _) = service();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let (token, _) = sign(
            &UserId::from("alice"),
            b"access-secret",
            Duration::from_secs(60),
            past,
        )
        .unwrap();

        assert!(matches!(
            svc.validate_access(&token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (svc, _) = service();
        let (token, _) = sign(
            &UserId::from("alice"),
            b"someone-else",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(
            svc.validate_access(&token),
            Err(AuthError::TokenInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let (svc, _) = service();
        let session = svc.issue(&UserId::from("alice")).await.unwrap();

        assert!(svc.validate_access(&session.refresh_token.0).is_err());
    }

    #[tokio::test]
    async fn test_empty_subject_rejected() {
        let (svc, _) = service();
        let (token, _) = sign(
            &UserId::from(""),
            b"access-secret",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap();

        assert!(svc.validate_access(&token).is_err());
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let (svc, _) = service();
        assert!(svc.validate_access("not.a.jwt").is_err());
        assert!(svc.validate_access("").is_err());
    }

    #[tokio::test]
    async fn test_rotate_is_single_use() {
        let (svc, store) = service();
        let alice = UserId::from("alice");
        let first = svc.issue(&alice).await.unwrap();

        let second = svc.rotate_refresh(&first.refresh_token.0).await.unwrap();
        assert_eq!(second.user_id, alice);
        assert_ne!(second.refresh_token, first.refresh_token);

        assert!(matches!(
            svc.rotate_refresh(&first.refresh_token.0).await,
            Err(AuthError::TokenRevoked)
        ));

        let old = store
            .get_refresh_token(&first.refresh_token.0)
            .await
            .unwrap();
        assert!(old.revoked);

        // The new one is still good.
        assert!(svc.rotate_refresh(&second.refresh_token.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotate_unknown_token() {
        let (svc, _) = service();
        let (token, _) = sign(
            &UserId::from("alice"),
            b"refresh-secret",
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(
            svc.rotate_refresh(&token).await,
            Err(AuthError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_rotate_expired_record() {
        let (svc, store) = service();
        let alice = UserId::from("alice");
        let session = svc.issue(&alice).await.unwrap();
        store
            .save_refresh_token(
                &alice,
                &session.refresh_token.0,
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        assert!(svc.rotate_refresh(&session.refresh_token.0).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_blocks_rotation() {
        let (svc, _) = service();
        let session = svc.issue(&UserId::from("alice")).await.unwrap();

        svc.revoke(&session.refresh_token.0).await;
        assert!(svc.rotate_refresh(&session.refresh_token.0).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_without_store() {
        let svc = JwtSessionService::new(config(), None);
        let session = svc.issue(&UserId::from("alice")).await.unwrap();

        assert!(matches!(
            svc.rotate_refresh(&session.refresh_token.0).await,
            Err(AuthError::Unavailable)
        ));
    }
}
