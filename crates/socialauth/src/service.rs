//! Authentication service.
//!
//! [`SocialAuthService`] ties registered backends, storage and the pipeline
//! together:
//!
//! 1. **Begin** - build the provider redirect ([`begin`](SocialAuthService::begin))
//! 2. **Complete** - validate the callback and run the pipeline
//!    ([`complete`](SocialAuthService::complete))
//! 3. **Resume** - continue a suspended run ([`resume`](SocialAuthService::resume))
//!
//! # Example
//!
//! ```ignore
//! let service = SocialAuthService::new(settings, users, partials)?;
//! service.register_backend(Arc::new(oidc_backend)).await;
//!
//! // Request 1: redirect the browser
//! let url = service.begin("oidc", &session).await?;
//!
//! // Request 2: the provider calls back
//! match service.complete("oidc", &callback_params, &session).await? {
//!     AuthOutcome::Authenticated { user, .. } => { /* log the user in */ }
//!     AuthOutcome::Suspended { response, .. } => { /* e.g. ask for a password */ }
//!     AuthOutcome::Halted(response) => { /* redirect */ }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use url::Url;

use crate::backend::AuthBackend;
use crate::error::AuthError;
use crate::oauth2::CallbackParams;
use crate::pipeline::{
    DEFAULT_PIPELINE, PARTIAL_TOKEN_PARAM, PartialStateManager, Pipeline, PipelineContext,
    PipelineOutcome, StepRegistry, StepResponse,
};
use crate::settings::Settings;
use crate::storage::{PartialState, PartialStore, Session, SocialAccount, User, UserStore};
use crate::AuthResult;

/// Result of completing or resuming a login.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The pipeline ran to the end and resolved a user.
    Authenticated {
        /// The logged-in user.
        user: User,
        /// The social account used to log in.
        social: Option<SocialAccount>,
        /// Whether the user was created during this login.
        is_new: bool,
        /// Final keyword context.
        kwargs: Map<String, Value>,
    },
    /// A step suspended the run; resume it with `token`.
    Suspended {
        /// Partial pipeline token.
        token: String,
        /// What the step handed back.
        response: StepResponse,
    },
    /// A step stopped the run.
    Halted(StepResponse),
}

/// Entry point for social logins.
pub struct SocialAuthService {
    settings: Arc<Settings>,
    backends: Arc<RwLock<HashMap<String, Arc<dyn AuthBackend>>>>,
    pipeline: Pipeline,
    users: Arc<dyn UserStore>,
    partials: PartialStateManager,
}

impl SocialAuthService {
    /// Creates a service with the built-in steps.
    ///
    /// The pipeline is read from the global `pipeline` setting, falling back
    /// to [`DEFAULT_PIPELINE`].
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if a configured step is unknown.
    pub fn new(
        settings: Settings,
        users: Arc<dyn UserStore>,
        partials: Arc<dyn PartialStore>,
    ) -> AuthResult<Self> {
        Self::with_registry(settings, &StepRegistry::with_defaults(), users, partials)
    }

    /// Creates a service resolving its pipeline against `registry`.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if a configured step is unknown, or a
    /// configuration error if the `pipeline` setting is not a list of names.
    pub fn with_registry(
        settings: Settings,
        registry: &StepRegistry,
        users: Arc<dyn UserStore>,
        partials: Arc<dyn PartialStore>,
    ) -> AuthResult<Self> {
        let names: Vec<String> = match settings.global.get("pipeline") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                AuthError::configuration(format!("invalid pipeline setting: {e}"))
            })?,
            None => DEFAULT_PIPELINE.iter().map(|s| (*s).to_string()).collect(),
        };
        let pipeline = Pipeline::resolve(registry, names.as_slice())?;
        tracing::debug!("Resolved pipeline {:?}", pipeline);

        Ok(Self {
            settings: Arc::new(settings),
            backends: Arc::new(RwLock::new(HashMap::new())),
            pipeline,
            users,
            partials: PartialStateManager::new(partials),
        })
    }

    /// Replaces the pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Operator settings.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// The pipeline run after each callback.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Registers a backend under its name, replacing any previous one.
    pub async fn register_backend(&self, backend: Arc<dyn AuthBackend>) {
        let name = backend.name().to_string();
        self.backends.write().await.insert(name.clone(), backend);
        tracing::debug!("Registered auth backend {}", name);
    }

    /// Looks a backend up by name.
    ///
    /// # Errors
    ///
    /// Returns `MissingBackend` if no backend has this name.
    pub async fn get_backend(&self, name: &str) -> AuthResult<Arc<dyn AuthBackend>> {
        self.backends
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::missing_backend(name))
    }

    /// Names of the registered backends, sorted.
    pub async fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts a login and returns the provider redirect.
    pub async fn begin(&self, backend: &str, session: &dyn Session) -> AuthResult<Url> {
        self.get_backend(backend).await?.auth_url(session).await
    }

    /// Handles a provider callback.
    ///
    /// If the request or session points at a suspended run of this backend,
    /// that run is resumed with the callback parameters instead.
    ///
    /// # Errors
    ///
    /// Returns the backend's validation error or the first pipeline error.
    pub async fn complete(
        &self,
        backend: &str,
        params: &CallbackParams,
        session: &dyn Session,
    ) -> AuthResult<AuthOutcome> {
        let auth_backend = self.get_backend(backend).await?;

        let request_token = params.get(PARTIAL_TOKEN_PARAM).map(String::as_str);
        let identity = params.get(auth_backend.id_key()).map(String::as_str);
        if let Some(state) = self
            .partials
            .load_for(backend, request_token, identity, session)
            .await?
        {
            let extra = params
                .iter()
                .filter(|(k, _)| k.as_str() != PARTIAL_TOKEN_PARAM)
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            return self.continue_partial(auth_backend, state, extra, session).await;
        }

        let response = auth_backend.complete(params, session).await?;
        let mut ctx = PipelineContext::new(
            auth_backend,
            Arc::clone(&self.settings),
            Arc::clone(&self.users),
            response,
        );
        self.run_pipeline(&mut ctx, 0, None, session).await
    }

    /// Resumes a suspended run with extra arguments.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if `token` does not name a suspended run of
    /// `backend`, or the first pipeline error.
    pub async fn resume(
        &self,
        backend: &str,
        token: &str,
        extra: Map<String, Value>,
        session: &dyn Session,
    ) -> AuthResult<AuthOutcome> {
        let auth_backend = self.get_backend(backend).await?;
        let state = self
            .partials
            .load_for(backend, Some(token), None, session)
            .await?
            .ok_or_else(|| AuthError::pipeline(format!("no suspended {backend} pipeline for token")))?;
        self.continue_partial(auth_backend, state, extra, session).await
    }

    /// Drops a suspended run.
    pub async fn abandon(&self, token: &str, session: &dyn Session) -> AuthResult<()> {
        self.partials.destroy(token, session).await?;
        tracing::debug!("Abandoned partial pipeline");
        Ok(())
    }

    async fn continue_partial(
        &self,
        backend: Arc<dyn AuthBackend>,
        state: PartialState,
        extra: Map<String, Value>,
        session: &dyn Session,
    ) -> AuthResult<AuthOutcome> {
        self.pipeline
            .check_resume_point(state.next_step, &state.step_name)?;
        tracing::debug!(
            "Resuming {} pipeline at step {} ({})",
            state.backend,
            state.next_step,
            state.step_name
        );

        let mut ctx = PipelineContext::restore(
            backend,
            Arc::clone(&self.settings),
            Arc::clone(&self.users),
            &state,
            extra,
        )
        .await?;
        self.run_pipeline(&mut ctx, state.next_step, Some(&state.token), session)
            .await
    }

    async fn run_pipeline(
        &self,
        ctx: &mut PipelineContext,
        start: usize,
        previous_token: Option<&str>,
        session: &dyn Session,
    ) -> AuthResult<AuthOutcome> {
        let outcome = self.pipeline.run(ctx, start, &self.partials, session).await?;

        match outcome {
            PipelineOutcome::Completed => {
                if let Some(token) = previous_token {
                    self.partials.destroy(token, session).await?;
                }
                let user = ctx.user.clone().ok_or_else(|| {
                    AuthError::pipeline("pipeline finished without resolving a user")
                })?;
                tracing::info!(
                    "Authenticated user {} via {}",
                    user.username,
                    ctx.backend.name()
                );
                Ok(AuthOutcome::Authenticated {
                    user,
                    social: ctx.social.clone(),
                    is_new: ctx.get_bool("is_new"),
                    kwargs: ctx.kwargs.clone(),
                })
            }
            PipelineOutcome::Suspended { token, response } => {
                if let Some(previous) = previous_token.filter(|p| *p != token) {
                    self.partials.destroy(previous, session).await?;
                }
                Ok(AuthOutcome::Suspended { token, response })
            }
            PipelineOutcome::Halted(response) => {
                if let Some(token) = previous_token {
                    self.partials.destroy(token, session).await?;
                }
                Ok(AuthOutcome::Halted(response))
            }
        }
    }
}
