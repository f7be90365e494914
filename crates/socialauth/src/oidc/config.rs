//! Typed OpenID Connect settings for one backend.

use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AuthError;
use crate::settings::{Settings, SettingsMap, flexible_duration, flexible_string};
use crate::AuthResult;

/// Scopes requested unless `ignore_default_scope` is set.
pub const DEFAULT_SCOPE: &[&str] = &["openid", "profile", "email"];

/// OpenID Connect settings after backend → global → default resolution.
///
/// Endpoint fields left unset here fall back to the provider's discovery
/// document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Base URL of the provider; discovery is fetched below it.
    #[serde(deserialize_with = "flexible_string")]
    pub oidc_endpoint: Option<String>,

    /// OAuth client id.
    #[serde(deserialize_with = "flexible_string")]
    pub key: Option<String>,

    /// OAuth client secret.
    #[serde(deserialize_with = "flexible_string")]
    pub secret: Option<String>,

    /// Callback URL registered with the provider.
    #[serde(deserialize_with = "flexible_string")]
    pub redirect_uri: Option<String>,

    /// Extra scopes requested on top of the defaults.
    pub scope: Vec<String>,

    /// Request only `scope`, without the default OIDC scopes.
    pub ignore_default_scope: bool,

    #[serde(deserialize_with = "flexible_string")]
    pub authorization_url: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub access_token_url: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub revoke_token_url: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub id_token_issuer: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub userinfo_url: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub jwks_uri: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub token_endpoint_auth_method: Option<String>,

    /// Accepted ID token algorithms. The first one is assumed for keys that
    /// do not declare an `alg`.
    pub jwt_algorithms: Vec<String>,

    /// Clock leeway applied by the JWT time checks.
    #[serde(deserialize_with = "flexible_duration")]
    pub jwt_leeway: Duration,

    /// Maximum age of the `iat` claim.
    #[serde(deserialize_with = "flexible_duration")]
    pub id_token_max_age: Duration,

    /// Whether to merge the userinfo document into the identity when a
    /// userinfo endpoint is known.
    pub fetch_userinfo: bool,

    #[serde(deserialize_with = "flexible_string")]
    pub display: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
    #[serde(deserialize_with = "flexible_string")]
    pub ui_locales: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub id_token_hint: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub login_hint: Option<String>,
    #[serde(deserialize_with = "flexible_string")]
    pub acr_values: Option<String>,

    /// Email domains allowed to log in. Empty means any.
    pub whitelisted_domains: Vec<String>,

    /// Email addresses allowed to log in. Empty means any.
    pub whitelisted_emails: Vec<String>,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            oidc_endpoint: None,
            key: None,
            secret: None,
            redirect_uri: None,
            scope: Vec::new(),
            ignore_default_scope: false,
            authorization_url: None,
            access_token_url: None,
            revoke_token_url: None,
            id_token_issuer: None,
            userinfo_url: None,
            jwks_uri: None,
            token_endpoint_auth_method: None,
            jwt_algorithms: vec!["RS256".to_string()],
            jwt_leeway: Duration::from_secs(1),
            id_token_max_age: Duration::from_secs(600),
            fetch_userinfo: true,
            display: None,
            prompt: None,
            max_age: None,
            ui_locales: None,
            id_token_hint: None,
            login_hint: None,
            acr_values: None,
            whitelisted_domains: Vec::new(),
            whitelisted_emails: Vec::new(),
        }
    }
}

impl OidcSettings {
    /// Resolves the settings of `backend`, with `defaults` as the lowest tier.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a value has the wrong type.
    pub fn resolve(backend: &str, settings: &Settings, defaults: &SettingsMap) -> AuthResult<Self> {
        let merged = settings.for_backend(backend).merged(defaults);
        serde_json::from_value(Value::Object(merged)).map_err(|e| {
            AuthError::configuration(format!("invalid settings for backend {backend}: {e}"))
        })
    }

    /// Returns the client id and secret.
    ///
    /// # Errors
    ///
    /// Returns `MissingConfiguration` naming `KEY` or `SECRET`.
    pub fn credentials(&self) -> AuthResult<(&str, &str)> {
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| AuthError::missing_configuration("KEY"))?;
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| AuthError::missing_configuration("SECRET"))?;
        Ok((key, secret))
    }

    /// Returns the scopes to request, defaults first, without duplicates.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = if self.ignore_default_scope {
            Vec::new()
        } else {
            DEFAULT_SCOPE.iter().map(|s| (*s).to_string()).collect()
        };
        for scope in &self.scope {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// Parses `jwt_algorithms`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown name or an empty list.
    pub fn algorithms(&self) -> AuthResult<Vec<Algorithm>> {
        if self.jwt_algorithms.is_empty() {
            return Err(AuthError::configuration("JWT_ALGORITHMS must not be empty"));
        }
        self.jwt_algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name).map_err(|_| {
                    AuthError::configuration(format!("unsupported JWT algorithm {name}"))
                })
            })
            .collect()
    }
}
