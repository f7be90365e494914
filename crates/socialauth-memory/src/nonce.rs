//! In-memory nonce store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use socialauth::AuthResult;
use socialauth::storage::{Nonce, NonceStore};
use uuid::Uuid;

type NonceKey = (String, String);

/// Nonces keyed by (server URL, handle).
///
/// `take` removes the entry under the shard lock, so concurrent redemptions
/// of one nonce see exactly one success.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    nonces: DashMap<NonceKey, Nonce>,
}

impl MemoryNonceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    /// Returns `true` if no nonce is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

fn key(server_url: &str, handle: &str) -> NonceKey {
    (server_url.to_string(), handle.to_string())
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn store(&self, server_url: &str, handle: &str, state: Option<&str>) -> AuthResult<Nonce> {
        let nonce = Nonce::new(server_url, handle, state.map(str::to_string));
        self.nonces.insert(key(server_url, handle), nonce.clone());
        Ok(nonce)
    }

    async fn get(&self, server_url: &str, handle: &str) -> AuthResult<Option<Nonce>> {
        Ok(self
            .nonces
            .get(&key(server_url, handle))
            .map(|entry| entry.value().clone()))
    }

    async fn remove(&self, ids: &[Uuid]) -> AuthResult<()> {
        self.nonces.retain(|_, nonce| !ids.contains(&nonce.id));
        Ok(())
    }

    async fn take(&self, server_url: &str, handle: &str) -> AuthResult<Option<Nonce>> {
        Ok(self
            .nonces
            .remove(&key(server_url, handle))
            .map(|(_, nonce)| nonce))
    }

    async fn cleanup_expired(&self, max_age: Duration) -> AuthResult<u64> {
        let before = self.nonces.len();
        self.nonces.retain(|_, nonce| !nonce.is_older_than(max_age));
        let removed = before.saturating_sub(self.nonces.len()) as u64;
        if removed > 0 {
            tracing::debug!("Removed {} expired nonces", removed);
        }
        Ok(removed)
    }
}
