//! In-memory session.

use async_trait::async_trait;
use dashmap::DashMap;
use socialauth::AuthResult;
use socialauth::storage::Session;

/// A single browser session held in memory.
#[derive(Debug, Default)]
pub struct MemorySession {
    values: DashMap<String, String>,
}

impl MemorySession {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` is set.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> AuthResult<Option<String>> {
        Ok(self.values.remove(key).map(|(_, v)| v))
    }
}
