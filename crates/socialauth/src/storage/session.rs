//! The per-browser session provided by the web framework.

use async_trait::async_trait;

use crate::AuthResult;

/// Key/value session scoped to one browser.
///
/// The core stores the OAuth2 state and the partial pipeline token here.
#[async_trait]
pub trait Session: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> AuthResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> AuthResult<()>;

    /// Removes and returns the value stored under `key`.
    async fn remove(&self, key: &str) -> AuthResult<Option<String>>;
}
