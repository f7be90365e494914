//! Storage of suspended pipeline runs.
//!
//! A [`PartialState`] captures everything needed to re-enter a pipeline at the
//! step that suspended it: the backend, the step index and the keyword context
//! accumulated so far. Live objects (the resolved user and social account) are
//! reduced to identifiers and reloaded on resume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;

/// Identifies a linked social account across requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialRef {
    /// Backend name.
    pub provider: String,
    /// Provider-side user id.
    pub uid: String,
}

/// A suspended pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialState {
    /// Unguessable token handed to the caller.
    pub token: String,

    /// Backend the run belongs to.
    pub backend: String,

    /// Index of the step to run on resume.
    pub next_step: usize,

    /// Name of that step, checked against the pipeline on resume.
    pub step_name: String,

    /// Keyword context accumulated by earlier steps.
    pub kwargs: Map<String, Value>,

    /// Id of the user resolved so far, if any.
    pub user_id: Option<Uuid>,

    /// Social account resolved so far, if any.
    pub social: Option<SocialRef>,

    /// When the run was suspended.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PartialState {
    /// Creates a partial state with a fresh token and an empty context.
    #[must_use]
    pub fn new(backend: impl Into<String>, next_step: usize, step_name: impl Into<String>) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            backend: backend.into(),
            next_step,
            step_name: step_name.into(),
            kwargs: Map::new(),
            user_id: None,
            social: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Merges new per-call arguments over the stored context.
    pub fn extend_kwargs(&mut self, extra: Map<String, Value>) {
        self.kwargs.extend(extra);
    }
}

/// Storage trait for suspended pipeline runs.
///
/// # Ownership
///
/// The store owns every [`PartialState`]. The executor only keeps the token
/// while a run is suspended; stale entries are left to the store's own
/// expiry policy.
#[async_trait]
pub trait PartialStore: Send + Sync {
    /// Builds a new partial state without persisting it.
    fn prepare(&self, backend: &str, next_step: usize, step_name: &str, kwargs: Map<String, Value>) -> PartialState {
        let mut state = PartialState::new(backend, next_step, step_name);
        state.kwargs = kwargs;
        state
    }

    /// Persists a partial state, replacing any entry with the same token.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn persist(&self, state: &PartialState) -> AuthResult<()>;

    /// Loads a partial state by token.
    ///
    /// # Returns
    ///
    /// Returns `None` if the token is unknown or was destroyed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn load(&self, token: &str) -> AuthResult<Option<PartialState>>;

    /// Deletes a partial state. Unknown tokens are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn destroy(&self, token: &str) -> AuthResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_context_per_instance() {
        let mut a = PartialState::new("oidc", 2, "get_username");
        let b = PartialState::new("oidc", 2, "get_username");

        a.kwargs.insert("a".into(), json!(1));
        assert!(b.kwargs.is_empty());
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 32);
    }

    #[test]
    fn test_extend_kwargs_overrides() {
        let mut state = PartialState::new("oidc", 0, "social_details");
        state.kwargs.insert("a".into(), json!(1));
        state.kwargs.insert("b".into(), json!("old"));

        let mut extra = Map::new();
        extra.insert("b".into(), json!(2));
        state.extend_kwargs(extra);

        assert_eq!(state.kwargs["a"], json!(1));
        assert_eq!(state.kwargs["b"], json!(2));
    }

    #[test]
    fn test_partial_serialization() {
        let mut state = PartialState::new("oidc", 3, "create_user");
        state.user_id = Some(Uuid::new_v4());
        state.social = Some(SocialRef {
            provider: "oidc".into(),
            uid: "123".into(),
        });

        let json = serde_json::to_value(&state).unwrap();
        let parsed: PartialState = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, state);
    }
}
