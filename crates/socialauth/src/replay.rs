//! Anti-replay values shared by OAuth2 and OIDC flows.
//!
//! Two mechanisms protect a login round trip:
//!
//! - The OAuth2 `state` parameter, kept in the browser session and compared
//!   when the provider redirects back ([`StateGuard`]).
//! - The OIDC `nonce`, kept in the [`NonceStore`] under the authorization URL
//!   and redeemed once when the ID token is validated ([`NonceGuard`]).

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::error::AuthError;
use crate::storage::{Nonce, NonceStore, Session};
use crate::AuthResult;

/// Length of generated nonces.
pub const NONCE_LENGTH: usize = 64;

/// Length of generated OAuth2 state values.
pub const STATE_LENGTH: usize = 32;

/// Returns a random string of ASCII letters and digits.
#[must_use]
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Compares two strings without short-circuiting on the first difference.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issues and checks the OAuth2 `state` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateGuard;

impl StateGuard {
    /// Session key holding the state for `backend`.
    #[must_use]
    pub fn session_key(backend: &str) -> String {
        format!("{backend}_state")
    }

    /// Generates a state value and stores it in the session.
    pub async fn issue(&self, session: &dyn Session, backend: &str) -> AuthResult<String> {
        let state = random_string(STATE_LENGTH);
        session.set(&Self::session_key(backend), &state).await?;
        Ok(state)
    }

    /// Checks the state returned by the provider against the session.
    ///
    /// # Errors
    ///
    /// - `MissingParameter("state")` if the callback carries no state
    /// - `StateMissing` if the session holds no state for `backend`
    /// - `StateForbidden` if the two values differ
    pub async fn validate(
        &self,
        session: &dyn Session,
        backend: &str,
        request_state: Option<&str>,
    ) -> AuthResult<String> {
        let request_state = request_state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::missing_parameter("state"))?;

        let stored = session
            .get(&Self::session_key(backend))
            .await?
            .ok_or(AuthError::StateMissing)?;

        if !constant_time_eq(request_state, &stored) {
            tracing::warn!("State mismatch for backend {}", backend);
            return Err(AuthError::StateForbidden);
        }

        Ok(stored)
    }
}

/// Issues and redeems OIDC nonces.
#[derive(Clone)]
pub struct NonceGuard {
    store: Arc<dyn NonceStore>,
}

impl NonceGuard {
    /// Creates a guard over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn NonceStore>) -> Self {
        Self { store }
    }

    /// Generates a nonce and persists it for `server_url`.
    pub async fn issue(&self, server_url: &str, state: Option<&str>) -> AuthResult<String> {
        let handle = random_string(NONCE_LENGTH);
        self.store.store(server_url, &handle, state).await?;
        tracing::trace!("Issued nonce for {}", server_url);
        Ok(handle)
    }

    /// Redeems a nonce. A nonce can be redeemed once; later attempts fail as
    /// if it had never been issued.
    ///
    /// # Errors
    ///
    /// Returns `Token("Incorrect id_token: nonce")` if the nonce is absent,
    /// already used, or was issued for another URL.
    pub async fn redeem(&self, server_url: &str, handle: &str) -> AuthResult<Nonce> {
        match self.store.take(server_url, handle).await? {
            Some(nonce) => Ok(nonce),
            None => {
                tracing::warn!("Rejected unknown or reused nonce for {}", server_url);
                Err(AuthError::token("Incorrect id_token: nonce"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        let a = random_string(NONCE_LENGTH);
        let b = random_string(NONCE_LENGTH);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(random_string(0).is_empty());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_session_key() {
        assert_eq!(StateGuard::session_key("oidc"), "oidc_state");
    }
}
