use super::util::is_dup_key;
use crate::application_impl::Argon2PasswordHasher;
use crate::application_port::CredentialHasher;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use std::sync::Arc;

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
  id VARCHAR(191) NOT NULL PRIMARY KEY,
  password_hash VARCHAR(255) NOT NULL DEFAULT '',
  display_name VARCHAR(255) NOT NULL DEFAULT '',
  created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS channels (
  id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
  name VARCHAR(191) NOT NULL UNIQUE,
  created_by VARCHAR(191) NOT NULL,
  created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
  FOREIGN KEY (created_by) REFERENCES users(id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS channel_members (
  channel_id BIGINT NOT NULL,
  user_id VARCHAR(191) NOT NULL,
  created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
  PRIMARY KEY (channel_id, user_id),
  FOREIGN KEY (channel_id) REFERENCES channels(id),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
)"#,
    r#"
CREATE TABLE IF NOT EXISTS messages (
  id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
  channel_id BIGINT NULL,
  user_id VARCHAR(191) NULL,
  subject VARCHAR(255) NOT NULL,
  payload LONGBLOB NOT NULL,
  created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
  INDEX idx_messages_channel (channel_id, id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS refresh_tokens (
  token VARCHAR(512) NOT NULL PRIMARY KEY,
  user_id VARCHAR(191) NOT NULL,
  expires_at DATETIME(6) NOT NULL,
  revoked BOOLEAN NOT NULL DEFAULT FALSE,
  created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
)"#,
];

pub struct MySqlStore {
    pool: MySqlPool,
    hasher: Arc<dyn CredentialHasher>,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlStore {
            pool,
            hasher: Arc::new(Argon2PasswordHasher::new()),
        }
    }

    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = MySqlPool::connect(dsn).await.map_err(backend)?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    fn row_to_user(row: MySqlRow) -> Result<User, StoreError> {
        Ok(User {
            id: UserId(row.try_get("id").map_err(backend)?),
            display_name: row.try_get("display_name").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    fn row_to_channel(row: MySqlRow) -> Result<Channel, StoreError> {
        Ok(Channel {
            id: ChannelId(row.try_get("id").map_err(backend)?),
            name: row.try_get("name").map_err(backend)?,
            created_by: UserId(row.try_get("created_by").map_err(backend)?),
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    fn row_to_message(row: MySqlRow) -> Result<ChannelMessage, StoreError> {
        let payload: Vec<u8> = row.try_get("payload").map_err(backend)?;
        let subject: String = row.try_get("subject").map_err(backend)?;
        Ok(ChannelMessage {
            id: row.try_get("id").map_err(backend)?,
            channel_id: ChannelId(row.try_get("channel_id").map_err(backend)?),
            user_id: UserId(row.try_get("user_id").map_err(backend)?),
            subject: subject
                .parse()
                .map_err(|e: InvalidSubject| StoreError::Backend(e.to_string()))?,
            payload: String::from_utf8_lossy(&payload).into_owned(),
            created_at: row.try_get("created_at").map_err(backend)?,
        })
    }

    async fn fetch_user(&self, user_id: &UserId) -> Result<User, StoreError> {
        let row = sqlx::query("SELECT id, display_name, created_at FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        Self::row_to_user(row)
    }
}

#[async_trait::async_trait]
impl Store for MySqlStore {
    async fn ensure_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        sqlx::query("INSERT IGNORE INTO users (id, password_hash) VALUES (?, '')")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn create_user(
        &self,
        user_id: &UserId,
        password: &str,
        display_name: &str,
    ) -> Result<User, StoreError> {
        let password_hash = self
            .hasher
            .hash_password(password)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("INSERT INTO users (id, password_hash, display_name) VALUES (?, ?, ?)")
            .bind(user_id.as_str())
            .bind(&password_hash)
            .bind(display_name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_dup_key(&e) {
                    StoreError::Conflict
                } else {
                    backend(e)
                }
            })?;

        self.fetch_user(user_id).await
    }

    async fn get_user(&self, user_id: &UserId) -> Result<User, StoreError> {
        self.fetch_user(user_id).await
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        sqlx::query("SELECT id, display_name, created_at FROM users ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(Self::row_to_user)
            .collect()
    }

    async fn update_user(
        &self,
        user_id: &UserId,
        display_name: &str,
        password: &str,
    ) -> Result<User, StoreError> {
        let password_hash = if password.is_empty() {
            None
        } else {
            Some(
                self.hasher
                    .hash_password(password)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
            )
        };

        sqlx::query(
            r#"
UPDATE users
SET display_name = IF(? = '', display_name, ?),
    password_hash = COALESCE(?, password_hash)
WHERE id = ?
"#,
        )
        .bind(display_name)
        .bind(display_name)
        .bind(password_hash)
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        // rows_affected is 0 for no-op updates too, so existence is decided by the read.
        self.fetch_user(user_id).await
    }

    async fn delete_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn verify_user_password(
        &self,
        user_id: &UserId,
        password: &str,
    ) -> Result<User, StoreError> {
        let row = sqlx::query(
            "SELECT id, display_name, created_at, password_hash FROM users WHERE id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::InvalidCredentials)?;

        let password_hash: String = row.try_get("password_hash").map_err(backend)?;
        if password_hash.is_empty() {
            return Err(StoreError::InvalidCredentials);
        }
        let ok = self
            .hasher
            .verify_password(password, &password_hash)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !ok {
            return Err(StoreError::InvalidCredentials);
        }
        Self::row_to_user(row)
    }

    async fn save_refresh_token(
        &self,
        user_id: &UserId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO refresh_tokens (token, user_id, expires_at, revoked)
VALUES (?, ?, ?, FALSE)
ON DUPLICATE KEY UPDATE user_id = VALUES(user_id), expires_at = VALUES(expires_at), revoked = FALSE
"#,
        )
        .bind(token)
        .bind(user_id.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_refresh_token(&self, token: &str) -> Result<RefreshTokenRecord, StoreError> {
        let row = sqlx::query(
            "SELECT token, user_id, expires_at, revoked FROM refresh_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StoreError::NotFound)?;

        Ok(RefreshTokenRecord {
            token: row.try_get("token").map_err(backend)?,
            user_id: UserId(row.try_get("user_id").map_err(backend)?),
            expires_at: row.try_get("expires_at").map_err(backend)?,
            revoked: row.try_get("revoked").map_err(backend)?,
        })
    }

    async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE token = ? AND revoked = FALSE")
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_channel(
        &self,
        name: &str,
        created_by: &UserId,
    ) -> Result<Channel, StoreError> {
        let result = sqlx::query("INSERT INTO channels (name, created_by) VALUES (?, ?)")
            .bind(name)
            .bind(created_by.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_dup_key(&e) {
                    StoreError::Conflict
                } else {
                    backend(e)
                }
            })?;

        let row = sqlx::query("SELECT id, name, created_by, created_at FROM channels WHERE id = ?")
            .bind(result.last_insert_id() as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Self::row_to_channel(row)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        sqlx::query("SELECT id, name, created_by, created_at FROM channels ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(Self::row_to_channel)
            .collect()
    }

    async fn ensure_member(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT IGNORE INTO channel_members (channel_id, user_id) VALUES (?, ?)")
            .bind(channel_id.0)
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn save_channel_message(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        payload: &[u8],
    ) -> Result<ChannelMessage, StoreError> {
        let subject = Subject::for_channel(channel_id);
        let result = sqlx::query(
            "INSERT INTO messages (channel_id, user_id, subject, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(channel_id.0)
        .bind(user_id.as_str())
        .bind(subject.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let row = sqlx::query(
            "SELECT id, channel_id, user_id, subject, payload, created_at FROM messages WHERE id = ?",
        )
        .bind(result.last_insert_id() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Self::row_to_message(row)
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, StoreError> {
        sqlx::query(
            r#"
SELECT id, channel_id, user_id, subject, payload, created_at
FROM messages
WHERE channel_id = ?
ORDER BY id DESC
LIMIT ?
"#,
        )
        .bind(channel_id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(Self::row_to_message)
        .collect()
    }

    async fn save_message(&self, subject: &Subject, payload: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO messages (subject, payload) VALUES (?, ?)")
            .bind(subject.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
