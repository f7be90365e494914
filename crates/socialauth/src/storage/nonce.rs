//! Nonce storage for OIDC replay prevention.
//!
//! Each nonce is bound to the authorization URL it was issued for and may be
//! redeemed once. The store is the only place single use is enforced, so
//! [`NonceStore::take`] has to be atomic.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;

/// A one-time value issued with an authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    /// Storage identifier.
    pub id: Uuid,

    /// Authorization URL the nonce was issued for.
    pub server_url: String,

    /// The nonce string sent to the provider.
    pub handle: String,

    /// OAuth2 state of the request that issued the nonce.
    pub state: Option<String>,

    /// When the nonce was issued.
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl Nonce {
    /// Creates a nonce issued now.
    #[must_use]
    pub fn new(server_url: impl Into<String>, handle: impl Into<String>, state: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_url: server_url.into(),
            handle: handle.into(),
            state,
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    /// Returns `true` if the nonce is older than `max_age`.
    #[must_use]
    pub fn is_older_than(&self, max_age: Duration) -> bool {
        let age = OffsetDateTime::now_utc() - self.issued_at;
        age.whole_milliseconds() > max_age.as_millis() as i128
    }
}

/// Storage trait for OIDC nonces.
///
/// # Atomicity
///
/// Redeeming a nonce must be a single compare-and-delete. Calling
/// [`get`](Self::get) and then [`remove`](Self::remove) leaves a window in
/// which two concurrent callbacks can both see the nonce; the validator only
/// uses [`take`](Self::take).
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Stores a new nonce for `server_url`.
    ///
    /// # Arguments
    ///
    /// * `server_url` - The authorization URL the nonce belongs to
    /// * `handle` - The nonce value
    /// * `state` - The OAuth2 state sent alongside the nonce
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn store(&self, server_url: &str, handle: &str, state: Option<&str>) -> AuthResult<Nonce>;

    /// Looks up a nonce without consuming it.
    ///
    /// # Returns
    ///
    /// Returns `None` if no nonce with this handle exists for `server_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get(&self, server_url: &str, handle: &str) -> AuthResult<Option<Nonce>>;

    /// Deletes nonces by id. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove(&self, ids: &[Uuid]) -> AuthResult<()>;

    /// Atomically looks up and deletes a nonce.
    ///
    /// Exactly one of any number of concurrent callers receives `Some`.
    /// A SQL backend can implement this as:
    ///
    /// ```sql
    /// DELETE FROM nonces
    /// WHERE server_url = $1 AND handle = $2
    /// RETURNING *
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn take(&self, server_url: &str, handle: &str) -> AuthResult<Option<Nonce>>;

    /// Deletes nonces issued longer than `max_age` ago.
    ///
    /// # Returns
    ///
    /// Returns the number of entries deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup operation fails.
    async fn cleanup_expired(&self, max_age: Duration) -> AuthResult<u64>;
}
