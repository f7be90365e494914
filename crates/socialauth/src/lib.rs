//! # socialauth
//!
//! OpenID Connect login core with a resumable user pipeline.
//!
//! This crate provides:
//! - Provider discovery and JWKS caching
//! - ID token validation (signature, audience, issuer, expiry, `at_hash`,
//!   time window and single-use nonce)
//! - The OIDC authorization-code flow as an explicit state machine
//! - A pipeline of named steps that turns a validated identity into a local
//!   user, with suspend/resume across requests
//! - Storage traits for nonces, partial pipelines, users and sessions
//!
//! ## Modules
//!
//! - [`settings`] - Operator settings and their tiered resolution
//! - [`error`] - Error taxonomy
//! - [`discovery`] - Provider metadata discovery and caching
//! - [`jwks`] - Signing key retrieval and caching
//! - [`replay`] - OAuth2 state and OIDC nonce handling
//! - [`oauth2`] - Token exchange, revocation, userinfo and provider errors
//! - [`oidc`] - OIDC settings, token validation and the login flow
//! - [`backend`] - The backend contract consumed by the pipeline
//! - [`pipeline`] - Step registry, executor and built-in steps
//! - [`service`] - The service tying backends, storage and pipeline together
//! - [`storage`] - Storage traits

pub mod backend;
pub mod discovery;
pub mod error;
pub mod jwks;
pub mod oauth2;
pub mod oidc;
pub mod pipeline;
pub mod replay;
pub mod service;
pub mod settings;
pub mod storage;

pub use backend::{AuthBackend, AuthResponse};
pub use error::{AuthError, ErrorCategory};
pub use oidc::{OidcBackend, OidcServices, OidcServicesConfig};
pub use pipeline::{Pipeline, PipelineContext, PipelineStep, StepOutput, StepRegistry, StepResponse};
pub use service::{AuthOutcome, SocialAuthService};
pub use settings::Settings;

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use socialauth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::backend::{AuthBackend, AuthResponse};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::oauth2::CallbackParams;
    pub use crate::oidc::{OidcBackend, OidcServices, OidcServicesConfig, OidcSettings};
    pub use crate::pipeline::{
        Pipeline, PipelineContext, PipelineOutcome, PipelineStep, StepOutput, StepRegistry,
        StepResponse,
    };
    pub use crate::service::{AuthOutcome, SocialAuthService};
    pub use crate::settings::Settings;
    pub use crate::storage::{
        Nonce, NonceStore, PartialState, PartialStore, Session, SocialAccount, User, UserStore,
    };
}
