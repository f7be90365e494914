//! In-memory partial pipeline store.

use async_trait::async_trait;
use dashmap::DashMap;
use socialauth::AuthResult;
use socialauth::storage::{PartialState, PartialStore};

/// Suspended pipeline runs keyed by token.
#[derive(Debug, Default)]
pub struct MemoryPartialStore {
    partials: DashMap<String, PartialState>,
}

impl MemoryPartialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of suspended runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    /// Returns `true` if no run is suspended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

#[async_trait]
impl PartialStore for MemoryPartialStore {
    async fn persist(&self, state: &PartialState) -> AuthResult<()> {
        self.partials.insert(state.token.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, token: &str) -> AuthResult<Option<PartialState>> {
        Ok(self.partials.get(token).map(|entry| entry.value().clone()))
    }

    async fn destroy(&self, token: &str) -> AuthResult<()> {
        self.partials.remove(token);
        Ok(())
    }
}
