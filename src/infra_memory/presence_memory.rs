use crate::domain_port::*;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryPresence {
    counters: DashMap<String, i64>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &str) -> i64 {
        self.counters.get(key).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Presence for MemoryPresence {
    async fn incr(&self, key: &str) -> Result<(), PresenceError> {
        *self.counters.entry(key.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    async fn decr(&self, key: &str) -> Result<(), PresenceError> {
        *self.counters.entry(key.to_owned()).or_insert(0) -= 1;
        Ok(())
    }
}
