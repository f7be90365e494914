//! OpenID Connect support.
//!
//! - [`config`] - typed per-backend settings
//! - [`params`] - optional authorization request parameters
//! - [`claims`] - ID token claims and `at_hash`
//! - [`validator`] - ID token validation
//! - [`flow`] - the authorization-code flow and the generic OIDC backend

pub mod claims;
pub mod config;
pub mod flow;
pub mod params;
pub mod validator;

pub use claims::{IdTokenClaims, compute_at_hash};
pub use config::{DEFAULT_SCOPE, OidcSettings};
pub use flow::{FlowState, OidcBackend, OidcFlow, OidcServices, OidcServicesConfig};
pub use params::optional_params;
pub use validator::{TokenValidator, ValidationParams, check_time_window};
