use crate::application_impl::Argon2PasswordHasher;
use crate::application_port::CredentialHasher;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

struct UserRow {
    user: User,
    password_hash: String,
}

/// Process-local `Store`. Nothing survives a restart.
pub struct MemoryStore {
    hasher: Arc<dyn CredentialHasher>,
    users: DashMap<UserId, UserRow>,
    refresh_tokens: DashMap<String, RefreshTokenRecord>,
    channels: Mutex<Vec<Channel>>,
    members: DashMap<(ChannelId, UserId), DateTime<Utc>>,
    messages: Mutex<Vec<ChannelMessage>>,
    subject_messages: Mutex<Vec<(Subject, Vec<u8>)>>,
    next_channel_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_hasher(Arc::new(Argon2PasswordHasher::new()))
    }

    pub fn with_hasher(hasher: Arc<dyn CredentialHasher>) -> Self {
        Self {
            hasher,
            users: DashMap::new(),
            refresh_tokens: DashMap::new(),
            channels: Mutex::new(Vec::new()),
            members: DashMap::new(),
            messages: Mutex::new(Vec::new()),
            subject_messages: Mutex::new(Vec::new()),
            next_channel_id: AtomicI64::new(1),
            next_message_id: AtomicI64::new(1),
        }
    }

    pub fn is_member(&self, channel_id: ChannelId, user_id: &UserId) -> bool {
        self.members.contains_key(&(channel_id, user_id.clone()))
    }

    pub fn subject_message_count(&self) -> usize {
        self.subject_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn backend<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend(e.to_string())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ensure_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        self.users.entry(user_id.clone()).or_insert_with(|| UserRow {
            user: User {
                id: user_id.clone(),
                display_name: String::new(),
                created_at: Utc::now(),
            },
            password_hash: String::new(),
        });
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
            .map_err(Self::backend)?;

        match self.users.entry(user_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                let user = User {
                    id: user_id.clone(),
                    display_name: display_name.to_owned(),
                    created_at: Utc::now(),
                };
                slot.insert(UserRow {
                    user: user.clone(),
                    password_hash,
                });
                Ok(user)
            }
        }
    }

    async fn get_user(&self, user_id: &UserId) -> Result<User, StoreError> {
        self.users
            .get(user_id)
            .map(|row| row.user.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.users.iter().map(|row| row.user.clone()).collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(users)
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
                    .map_err(Self::backend)?,
            )
        };

        let mut row = self.users.get_mut(user_id).ok_or(StoreError::NotFound)?;
        if !display_name.is_empty() {
            row.user.display_name = display_name.to_owned();
        }
        if let Some(hash) = password_hash {
            row.password_hash = hash;
        }
        Ok(row.user.clone())
    }

    async fn delete_user(&self, user_id: &UserId) -> Result<(), StoreError> {
        self.users
            .remove(user_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)?;
        self.refresh_tokens.retain(|_, r| &r.user_id != user_id);
        self.members.retain(|(_, member), _| member != user_id);
        Ok(())
    }

    async fn verify_user_password(
        &self,
        user_id: &UserId,
        password: &str,
    ) -> Result<User, StoreError> {
        let (user, password_hash) = match self.users.get(user_id) {
            Some(row) => (row.user.clone(), row.password_hash.clone()),
            None => return Err(StoreError::InvalidCredentials),
        };
        if password_hash.is_empty() {
            return Err(StoreError::InvalidCredentials);
        }
        let ok = self
            .hasher
            .verify_password(password, &password_hash)
            .await
            .map_err(Self::backend)?;
        if ok {
            Ok(user)
        } else {
            Err(StoreError::InvalidCredentials)
        }
    }

    async fn save_refresh_token(
        &self,
        user_id: &UserId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.refresh_tokens.insert(
            token.to_owned(),
            RefreshTokenRecord {
                token: token.to_owned(),
                user_id: user_id.clone(),
                expires_at,
                revoked: false,
            },
        );
        Ok(())
    }

    async fn get_refresh_token(&self, token: &str) -> Result<RefreshTokenRecord, StoreError> {
        self.refresh_tokens
            .get(token)
            .map(|r| r.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError> {
        match self.refresh_tokens.get_mut(token) {
            Some(mut record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_channel(
        &self,
        name: &str,
        created_by: &UserId,
    ) -> Result<Channel, StoreError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if channels.iter().any(|c| c.name == name) {
            return Err(StoreError::Conflict);
        }
        let channel = Channel {
            id: ChannelId(self.next_channel_id.fetch_add(1, Ordering::Relaxed)),
            name: name.to_owned(),
            created_by: created_by.clone(),
            created_at: Utc::now(),
        };
        channels.push(channel.clone());
        Ok(channel)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn ensure_member(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        self.members
            .entry((channel_id, user_id.clone()))
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn save_channel_message(
        &self,
        channel_id: ChannelId,
        user_id: &UserId,
        payload: &[u8],
    ) -> Result<ChannelMessage, StoreError> {
        let message = ChannelMessage {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            channel_id,
            user_id: user_id.clone(),
            subject: Subject::for_channel(channel_id),
            payload: String::from_utf8_lossy(payload).into_owned(),
            created_at: Utc::now(),
        };
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, StoreError> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.channel_id == channel_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_message(&self, subject: &Subject, payload: &[u8]) -> Result<(), StoreError> {
        self.subject_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((subject.clone(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let hasher = Argon2PasswordHasher::with_cost(1024, 1).unwrap();
        MemoryStore::with_hasher(Arc::new(hasher))
    }

    #[tokio::test]
    async fn test_create_user_conflict() {
        let store = store();
        let alice = UserId::from("alice");

        store.create_user(&alice, "pass123", "Alice").await.unwrap();
        assert!(matches!(
            store.create_user(&alice, "other", "").await,
            Err(StoreError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_verify_password() {
        let store = store();
        let alice = UserId::from("alice");
        store.create_user(&alice, "pass123", "").await.unwrap();

        assert!(store.verify_user_password(&alice, "pass123").await.is_ok());
        assert!(matches!(
            store.verify_user_password(&alice, "nope").await,
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(
            store.verify_user_password(&UserId::from("bob"), "pass123").await,
            Err(StoreError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_ensured_user_cannot_login() {
        let store = store();
        let bob = UserId::from("bob");
        store.ensure_user(&bob).await.unwrap();

        assert!(store.verify_user_password(&bob, "").await.is_err());
    }

    #[tokio::test]
    async fn test_update_keeps_unset_fields() {
        let store = store();
        let alice = UserId::from("alice");
        store.create_user(&alice, "pass123", "Alice").await.unwrap();

        let user = store.update_user(&alice, "", "newpass").await.unwrap();
        assert_eq!(user.display_name, "Alice");
        assert!(store.verify_user_password(&alice, "newpass").await.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_only_once() {
        let store = store();
        let alice = UserId::from("alice");
        store
            .save_refresh_token(&alice, "t", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert!(store.revoke_refresh_token("t").await.unwrap());
        assert!(!store.revoke_refresh_token("t").await.unwrap());
        assert!(!store.revoke_refresh_token("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_messages_newest_first() {
        let store = store();
        let alice = UserId::from("alice");
        let channel = store.create_channel("general", &alice).await.unwrap();
        assert!(matches!(
            store.create_channel("general", &alice).await,
            Err(StoreError::Conflict)
        ));

        for body in ["one", "two", "three"] {
            store
                .save_channel_message(channel.id, &alice, body.as_bytes())
                .await
                .unwrap();
        }

        let latest = store.list_messages(channel.id, 2).await.unwrap();
        let payloads: Vec<_> = latest.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["three", "two"]);
    }
}
