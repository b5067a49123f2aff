use crate::domain_port::*;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

pub struct RedisPresence {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisPresence {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        RedisPresence {
            conn,
            prefix: prefix.into(),
        }
    }

    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url).map_err(|e| PresenceError(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PresenceError(e.to_string()))?;
        Ok(Self::new(conn, prefix))
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait::async_trait]
impl Presence for RedisPresence {
    async fn incr(&self, key: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .incr(self.key(key), 1)
            .await
            .map_err(|e| PresenceError(e.to_string()))?;
        Ok(())
    }

    async fn decr(&self, key: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .decr(self.key(key), 1)
            .await
            .map_err(|e| PresenceError(e.to_string()))?;
        Ok(())
    }
}
