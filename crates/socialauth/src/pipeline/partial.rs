//! Suspending and resuming pipeline runs.

use std::sync::Arc;

use serde_json::Value;

use crate::storage::{PartialState, PartialStore, Session, SocialRef};
use crate::AuthResult;

use super::context::PipelineContext;

/// Session key holding the token of the suspended run.
pub const PARTIAL_TOKEN_SESSION_KEY: &str = "partial_pipeline_token";

/// Callback parameter carrying the token of the suspended run.
pub const PARTIAL_TOKEN_PARAM: &str = "partial_token";

/// Captures, persists, loads and destroys partial states.
#[derive(Clone)]
pub struct PartialStateManager {
    store: Arc<dyn PartialStore>,
}

impl PartialStateManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PartialStore>) -> Self {
        Self { store }
    }

    /// Snapshots `ctx` so the run can re-enter at `next_step`.
    ///
    /// Nothing is persisted yet.
    #[must_use]
    pub fn capture(&self, ctx: &PipelineContext, next_step: usize, step_name: &str) -> PartialState {
        let mut state = self.store.prepare(
            ctx.backend.name(),
            next_step,
            step_name,
            ctx.kwargs.clone(),
        );
        state.user_id = ctx.user.as_ref().map(|u| u.id);
        state.social = ctx.social.as_ref().map(|s| SocialRef {
            provider: s.provider.clone(),
            uid: s.uid.clone(),
        });
        state
    }

    /// Persists a snapshot and, if asked to, remembers its token in the session.
    pub async fn persist(
        &self,
        state: &PartialState,
        session: &dyn Session,
        save_to_session: bool,
    ) -> AuthResult<()> {
        self.store.persist(state).await?;
        if save_to_session {
            session.set(PARTIAL_TOKEN_SESSION_KEY, &state.token).await?;
        }
        tracing::debug!(
            "Suspended {} pipeline at step {} ({})",
            state.backend,
            state.next_step,
            state.step_name
        );
        Ok(())
    }

    /// Loads a partial state by token.
    pub async fn load(&self, token: &str) -> AuthResult<Option<PartialState>> {
        self.store.load(token).await
    }

    /// Finds the suspended run of `backend` for this request.
    ///
    /// The request token wins over the session token. A token that is unknown,
    /// belongs to another backend, or was suspended for another user than
    /// `identity` is destroyed and `None` is returned.
    pub async fn load_for(
        &self,
        backend: &str,
        request_token: Option<&str>,
        identity: Option<&str>,
        session: &dyn Session,
    ) -> AuthResult<Option<PartialState>> {
        let token = match request_token.filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => match session.get(PARTIAL_TOKEN_SESSION_KEY).await? {
                Some(token) if !token.is_empty() => token,
                _ => return Ok(None),
            },
        };

        match self.store.load(&token).await? {
            Some(state) if state.backend == backend => {
                let stored = state.kwargs.get("uid").and_then(Value::as_str);
                if let (Some(identity), Some(stored)) = (identity, stored)
                    && identity != stored
                {
                    tracing::debug!(
                        "Discarding partial {} pipeline suspended for another user",
                        backend
                    );
                    self.destroy(&token, session).await?;
                    return Ok(None);
                }
                Ok(Some(state))
            }
            Some(state) => {
                tracing::debug!(
                    "Discarding partial pipeline of backend {} while completing {}",
                    state.backend,
                    backend
                );
                self.destroy(&token, session).await?;
                Ok(None)
            }
            None => {
                self.destroy(&token, session).await?;
                Ok(None)
            }
        }
    }

    /// Destroys a partial state and forgets it in the session.
    pub async fn destroy(&self, token: &str, session: &dyn Session) -> AuthResult<()> {
        self.store.destroy(token).await?;
        if session.get(PARTIAL_TOKEN_SESSION_KEY).await?.as_deref() == Some(token) {
            session.remove(PARTIAL_TOKEN_SESSION_KEY).await?;
        }
        Ok(())
    }
}
