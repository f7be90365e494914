//! Context threaded through one pipeline run.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::backend::{AuthBackend, AuthResponse};
use crate::error::AuthError;
use crate::settings::Settings;
use crate::storage::{PartialState, SocialAccount, User, UserStore};
use crate::AuthResult;

/// Keyword context key holding the validated provider response.
pub const RESPONSE_KEY: &str = "response";

/// Keyword context key holding the user details.
pub const DETAILS_KEY: &str = "details";

/// Everything the steps of one run can see and change.
///
/// `kwargs` is the growing set of named results; `user` and `social` hold the
/// live records resolved so far. Only `kwargs` and the ids of the live records
/// survive a suspension.
pub struct PipelineContext {
    /// Backend that authenticated the user.
    pub backend: Arc<dyn AuthBackend>,
    /// Operator settings.
    pub settings: Arc<Settings>,
    /// User storage.
    pub users: Arc<dyn UserStore>,
    /// Named results contributed by the steps so far.
    pub kwargs: Map<String, Value>,
    /// Local user, once resolved.
    pub user: Option<User>,
    /// Linked social account, once resolved.
    pub social: Option<SocialAccount>,
}

impl PipelineContext {
    /// Starts a context for a fresh run over `response`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        settings: Arc<Settings>,
        users: Arc<dyn UserStore>,
        response: AuthResponse,
    ) -> Self {
        let mut kwargs = Map::new();
        kwargs.insert(RESPONSE_KEY.to_string(), Value::Object(response.data));
        Self {
            backend,
            settings,
            users,
            kwargs,
            user: None,
            social: None,
        }
    }

    /// Rebuilds the context of a suspended run.
    ///
    /// `extra` is merged over the stored keyword context. The user and social
    /// account are reloaded from storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a lookup fails.
    pub async fn restore(
        backend: Arc<dyn AuthBackend>,
        settings: Arc<Settings>,
        users: Arc<dyn UserStore>,
        state: &PartialState,
        extra: Map<String, Value>,
    ) -> AuthResult<Self> {
        let mut kwargs = state.kwargs.clone();
        kwargs.extend(extra);

        let user = match state.user_id {
            Some(id) => users.get_user(id).await?,
            None => None,
        };
        let social = match &state.social {
            Some(social) => users.get_social_auth(&social.provider, &social.uid).await?,
            None => None,
        };

        Ok(Self {
            backend,
            settings,
            users,
            kwargs,
            user,
            social,
        })
    }

    /// Merges a step's output into the keyword context.
    pub fn merge(&mut self, output: Map<String, Value>) {
        self.kwargs.extend(output);
    }

    /// Returns a keyword value, treating `null` as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key).filter(|v| !v.is_null())
    }

    /// Returns a non-empty string keyword value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Returns a boolean keyword value.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// The provider response the run started from.
    #[must_use]
    pub fn response(&self) -> AuthResponse {
        let data = match self.kwargs.get(RESPONSE_KEY) {
            Some(Value::Object(data)) => data.clone(),
            _ => Map::new(),
        };
        AuthResponse {
            backend: self.backend.name().to_string(),
            data,
        }
    }

    /// User details collected so far.
    #[must_use]
    pub fn details(&self) -> Map<String, Value> {
        match self.kwargs.get(DETAILS_KEY) {
            Some(Value::Object(details)) => details.clone(),
            _ => Map::new(),
        }
    }

    /// Provider-side user id.
    ///
    /// # Errors
    ///
    /// Returns `MissingParameter("uid")` before `social_uid` has run.
    pub fn uid(&self) -> AuthResult<String> {
        self.get_str("uid")
            .map(str::to_string)
            .ok_or_else(|| AuthError::missing_parameter("uid"))
    }

    /// Returns a setting resolved for the current backend.
    #[must_use]
    pub fn setting(&self, name: &str) -> Option<&Value> {
        self.settings.for_backend(self.backend.name()).get(name)
    }

    /// Returns a boolean setting, or `default`.
    #[must_use]
    pub fn setting_bool(&self, name: &str, default: bool) -> bool {
        self.settings
            .for_backend(self.backend.name())
            .get_bool(name, default)
    }

    /// Deserializes a setting, or returns `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value has the wrong shape.
    pub fn setting_or<T: DeserializeOwned>(&self, name: &str, default: T) -> AuthResult<T> {
        self.settings
            .for_backend(self.backend.name())
            .get_or(name, default)
    }
}
