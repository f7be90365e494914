//! OpenID Connect authorization-code flow.
//!
//! One login attempt moves through these states:
//!
//! ```text
//! Init ─▶ Redirected ─▶ CallbackReceived ─▶ TokenExchanged ─▶ ClaimsValidated
//!   │          │               │                  │
//!   └──────────┴───────────────┴──────────────────┴──▶ Failed
//! ```
//!
//! The redirect and the callback happen in different requests, so nothing
//! but the session and the nonce store connects them. [`OidcBackend::auth_url`]
//! covers the first transition and [`OidcBackend::complete`] the rest.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use crate::backend::{AuthBackend, AuthResponse, email_allowed};
use crate::discovery::{DiscoveryCache, DiscoveryCacheConfig, ProviderMetadata};
use crate::error::AuthError;
use crate::jwks::{KeySetCache, KeySetCacheConfig};
use crate::oauth2::{CallbackParams, ClientAuthMethod, TokenClient, process_error};
use crate::replay::{NonceGuard, StateGuard};
use crate::settings::{Settings, SettingsMap};
use crate::storage::{NonceStore, Session};
use crate::AuthResult;

use super::config::OidcSettings;
use super::params::optional_params;
use super::validator::{TokenValidator, ValidationParams};

/// States of one OIDC login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Nothing has happened yet.
    Init,
    /// The authorization URL was built and the nonce stored.
    Redirected,
    /// The provider called back with an authorization code.
    CallbackReceived,
    /// The code was exchanged for an ID token and an access token.
    TokenExchanged,
    /// The ID token passed validation.
    ClaimsValidated,
    /// The attempt failed.
    Failed,
}

impl FlowState {
    /// Returns `true` for `ClaimsValidated` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ClaimsValidated | Self::Failed)
    }

    /// Returns `true` if `next` directly follows `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Redirected)
                | (Self::Redirected, Self::CallbackReceived)
                | (Self::CallbackReceived, Self::TokenExchanged)
                | (Self::TokenExchanged, Self::ClaimsValidated)
        ) || (next == Self::Failed && !self.is_terminal())
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Redirected => "redirected",
            Self::CallbackReceived => "callback_received",
            Self::TokenExchanged => "token_exchanged",
            Self::ClaimsValidated => "claims_validated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one login attempt.
#[derive(Debug, Clone)]
pub struct OidcFlow {
    state: FlowState,
}

impl Default for OidcFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl OidcFlow {
    /// Starts a flow in `Init`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FlowState::Init,
        }
    }

    /// Starts a flow whose redirect happened in an earlier request.
    #[must_use]
    pub fn redirected() -> Self {
        Self {
            state: FlowState::Redirected,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if `next` does not follow the current state.
    pub fn advance(&mut self, next: FlowState) -> AuthResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(AuthError::pipeline(format!(
                "illegal OIDC flow transition {} -> {}",
                self.state, next
            )));
        }
        tracing::trace!("OIDC flow {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed`, keeping `err` for the caller.
    pub fn fail(&mut self, err: &AuthError) {
        tracing::warn!(
            category = %err.category(),
            "OIDC flow failed in state {}: {}",
            self.state,
            err
        );
        self.state = FlowState::Failed;
    }
}

/// Tuning shared by every OIDC backend.
#[derive(Debug, Clone)]
pub struct OidcServicesConfig {
    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,
    /// Provider metadata cache TTL (default: 24 hours).
    pub metadata_ttl: Duration,
    /// JWKS cache TTL (default: 24 hours).
    pub jwks_ttl: Duration,
    /// Whether to allow HTTP endpoints (for testing only).
    pub allow_http: bool,
}

impl Default for OidcServicesConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            metadata_ttl: Duration::from_secs(86400),
            jwks_ttl: Duration::from_secs(86400),
            allow_http: false,
        }
    }
}

impl OidcServicesConfig {
    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the provider metadata cache TTL.
    #[must_use]
    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    /// Sets the JWKS cache TTL.
    #[must_use]
    pub fn with_jwks_ttl(mut self, ttl: Duration) -> Self {
        self.jwks_ttl = ttl;
        self
    }

    /// Allows HTTP endpoints (for testing only).
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Caches, HTTP client and nonce store shared by OIDC backends.
#[derive(Clone)]
pub struct OidcServices {
    discovery: Arc<DiscoveryCache>,
    keys: Arc<KeySetCache>,
    nonces: Arc<dyn NonceStore>,
    tokens: TokenClient,
}

impl OidcServices {
    /// Creates the shared services.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an HTTP client cannot be built.
    pub fn new(nonces: Arc<dyn NonceStore>, config: OidcServicesConfig) -> AuthResult<Self> {
        let discovery_config = DiscoveryCacheConfig::default()
            .with_ttl(config.metadata_ttl)
            .with_request_timeout(config.request_timeout)
            .with_allow_http(config.allow_http);

        let jwks_config = KeySetCacheConfig::default()
            .with_ttl(config.jwks_ttl)
            .with_request_timeout(config.request_timeout)
            .with_allow_http(config.allow_http);

        Ok(Self {
            discovery: Arc::new(DiscoveryCache::new(discovery_config)?),
            keys: Arc::new(KeySetCache::new(jwks_config)?),
            nonces,
            tokens: TokenClient::new(config.request_timeout)?,
        })
    }

    /// Provider metadata cache.
    #[must_use]
    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    /// Signing key cache.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeySetCache> {
        &self.keys
    }

    /// Nonce store.
    #[must_use]
    pub fn nonces(&self) -> &Arc<dyn NonceStore> {
        &self.nonces
    }
}

/// Generic OpenID Connect backend.
pub struct OidcBackend {
    name: String,
    settings: OidcSettings,
    services: OidcServices,
    validator: TokenValidator,
}

impl OidcBackend {
    /// Creates a backend named `name` from operator settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a setting has the wrong type.
    pub fn new(name: impl Into<String>, settings: &Settings, services: OidcServices) -> AuthResult<Self> {
        Self::with_defaults(name, settings, &SettingsMap::new(), services)
    }

    /// Creates a backend whose own defaults sit below the operator settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a setting has the wrong type.
    pub fn with_defaults(
        name: impl Into<String>,
        settings: &Settings,
        defaults: &SettingsMap,
        services: OidcServices,
    ) -> AuthResult<Self> {
        let name = name.into();
        let settings = OidcSettings::resolve(&name, settings, defaults)?;
        let validator = TokenValidator::new(
            Arc::clone(&services.keys),
            NonceGuard::new(Arc::clone(&services.nonces)),
        );
        Ok(Self {
            name,
            settings,
            services,
            validator,
        })
    }

    /// Resolved settings.
    #[must_use]
    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Returns the discovery document, or `None` without `OIDC_ENDPOINT`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document cannot be fetched.
    pub async fn provider_metadata(&self) -> AuthResult<Option<Arc<ProviderMetadata>>> {
        let Some(endpoint) = self.settings.oidc_endpoint.as_deref() else {
            return Ok(None);
        };
        let endpoint = parse_url("OIDC_ENDPOINT", endpoint)?;
        Ok(Some(self.services.discovery.get(&endpoint).await?))
    }

    /// Resolves a setting, falling back to the discovery document.
    async fn resolve(
        &self,
        field: &'static str,
        configured: Option<&str>,
        discovered: fn(&ProviderMetadata) -> Option<&str>,
    ) -> AuthResult<Option<String>> {
        if let Some(value) = configured.filter(|v| !v.is_empty()) {
            return Ok(Some(value.to_string()));
        }
        let value = self
            .provider_metadata()
            .await?
            .and_then(|metadata| discovered(&metadata).map(str::to_string))
            .filter(|v| !v.is_empty());
        if value.is_none() {
            tracing::trace!("{} not configured for backend {}", field, self.name);
        }
        Ok(value)
    }

    async fn require(
        &self,
        field: &'static str,
        configured: Option<&str>,
        discovered: fn(&ProviderMetadata) -> Option<&str>,
    ) -> AuthResult<String> {
        self.resolve(field, configured, discovered)
            .await?
            .ok_or_else(|| AuthError::missing_configuration(field))
    }

    /// Authorization endpoint.
    pub async fn authorization_url(&self) -> AuthResult<String> {
        self.require(
            "AUTHORIZATION_URL",
            self.settings.authorization_url.as_deref(),
            |m| m.authorization_endpoint.as_deref(),
        )
        .await
    }

    /// Token endpoint.
    pub async fn access_token_url(&self) -> AuthResult<String> {
        self.require(
            "ACCESS_TOKEN_URL",
            self.settings.access_token_url.as_deref(),
            |m| m.token_endpoint.as_deref(),
        )
        .await
    }

    /// Revocation endpoint.
    pub async fn revoke_token_url(&self) -> AuthResult<String> {
        self.require(
            "REVOKE_TOKEN_URL",
            self.settings.revoke_token_url.as_deref(),
            |m| m.revocation_endpoint.as_deref(),
        )
        .await
    }

    /// Expected ID token issuer.
    pub async fn id_token_issuer(&self) -> AuthResult<String> {
        self.require(
            "ID_TOKEN_ISSUER",
            self.settings.id_token_issuer.as_deref(),
            |m| Some(m.issuer.as_str()),
        )
        .await
    }

    /// JWKS location.
    pub async fn jwks_uri(&self) -> AuthResult<String> {
        self.require("JWKS_URI", self.settings.jwks_uri.as_deref(), |m| {
            m.jwks_uri.as_deref()
        })
        .await
    }

    /// Userinfo endpoint, if any tier provides one.
    pub async fn userinfo_url(&self) -> AuthResult<Option<String>> {
        self.resolve("USERINFO_URL", self.settings.userinfo_url.as_deref(), |m| {
            m.userinfo_endpoint.as_deref()
        })
        .await
    }

    /// How to authenticate at the token and revocation endpoints.
    pub async fn client_auth_method(&self) -> AuthResult<ClientAuthMethod> {
        let configured = self.settings.token_endpoint_auth_method.as_deref();
        let metadata = match configured {
            Some(_) => None,
            None => self.provider_metadata().await?,
        };
        Ok(ClientAuthMethod::resolve(configured, || {
            metadata.as_ref().is_none_or(|m| m.prefers_basic_auth())
        }))
    }

    fn redirect_uri(&self) -> AuthResult<&str> {
        self.settings
            .redirect_uri
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AuthError::missing_configuration("REDIRECT_URI"))
    }

    /// Revokes an access or refresh token at the provider.
    ///
    /// # Errors
    ///
    /// Returns `MissingConfiguration("REVOKE_TOKEN_URL")` if no revocation
    /// endpoint is known, or the provider's error.
    pub async fn revoke_token(&self, token: &str) -> AuthResult<()> {
        let endpoint = parse_url("REVOKE_TOKEN_URL", &self.revoke_token_url().await?)?;
        let (client_id, client_secret) = self.settings.credentials()?;
        let method = self.client_auth_method().await?;
        self.services
            .tokens
            .revoke_token(&endpoint, token, client_id, client_secret, method)
            .await
    }

    async fn build_auth_url(&self, session: &dyn Session) -> AuthResult<Url> {
        let optional = optional_params(&self.settings)?;
        let (client_id, _) = self.settings.credentials()?;
        let redirect_uri = self.redirect_uri()?;
        let authorization_url = self.authorization_url().await?;
        let mut url = parse_url("AUTHORIZATION_URL", &authorization_url)?;

        let state = StateGuard.issue(session, &self.name).await?;
        let nonce = NonceGuard::new(Arc::clone(&self.services.nonces))
            .issue(&authorization_url, Some(&state))
            .await?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.settings.scopes().join(" "))
                .append_pair("state", &state)
                .append_pair("nonce", &nonce);
            for (name, value) in &optional {
                query.append_pair(name, value);
            }
        }

        Ok(url)
    }

    async fn handle_callback(
        &self,
        flow: &mut OidcFlow,
        params: &CallbackParams,
        session: &dyn Session,
    ) -> AuthResult<AuthResponse> {
        process_error(params)?;
        StateGuard
            .validate(session, &self.name, params.get("state").map(String::as_str))
            .await?;
        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::missing_parameter("code"))?;
        flow.advance(FlowState::CallbackReceived)?;

        let token_url = parse_url("ACCESS_TOKEN_URL", &self.access_token_url().await?)?;
        let (client_id, client_secret) = self.settings.credentials()?;
        let method = self.client_auth_method().await?;
        let tokens = self
            .services
            .tokens
            .exchange_code(
                &token_url,
                code,
                self.redirect_uri()?,
                client_id,
                client_secret,
                method,
            )
            .await?;

        let id_token = tokens
            .id_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::missing_parameter("id_token"))?;
        let access_token = tokens
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::missing_parameter("access_token"))?;
        flow.advance(FlowState::TokenExchanged)?;

        let issuer = self.id_token_issuer().await?;
        let jwks_uri = parse_url("JWKS_URI", &self.jwks_uri().await?)?;
        let authorization_url = self.authorization_url().await?;
        let algorithms = self.settings.algorithms()?;
        let claims = self
            .validator
            .validate(
                id_token,
                access_token,
                &ValidationParams {
                    client_id,
                    issuer: &issuer,
                    jwks_uri: &jwks_uri,
                    authorization_url: &authorization_url,
                    algorithms: &algorithms,
                    leeway: self.settings.jwt_leeway,
                    max_age: self.settings.id_token_max_age,
                },
            )
            .await?;

        let mut data = claims.to_map();

        if self.settings.fetch_userinfo
            && let Some(userinfo_url) = self.userinfo_url().await?
        {
            let userinfo_url = parse_url("USERINFO_URL", &userinfo_url)?;
            let userinfo = self
                .services
                .tokens
                .fetch_userinfo(&userinfo_url, access_token)
                .await?;
            if let Some(sub) = userinfo.get("sub")
                && sub.as_str() != Some(claims.sub.as_str())
            {
                return Err(AuthError::token("Userinfo subject does not match the ID token"));
            }
            data.extend(userinfo);
        }

        data.insert("id_token".into(), Value::String(id_token.to_string()));
        data.insert("access_token".into(), Value::String(access_token.to_string()));
        let optional = [
            ("refresh_token", tokens.refresh_token.clone().map(Value::String)),
            ("token_type", tokens.token_type.clone().map(Value::String)),
            ("expires_in", tokens.expires_in.map(Value::from)),
            ("scope", tokens.scope.clone().map(Value::String)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                data.insert(key.to_string(), value);
            }
        }

        flow.advance(FlowState::ClaimsValidated)?;
        tracing::info!("OIDC login validated for backend {} (sub {})", self.name, claims.sub);

        Ok(AuthResponse {
            backend: self.name.clone(),
            data,
        })
    }
}

#[async_trait]
impl AuthBackend for OidcBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn auth_url(&self, session: &dyn Session) -> AuthResult<Url> {
        let mut flow = OidcFlow::new();
        match self.build_auth_url(session).await {
            Ok(url) => {
                flow.advance(FlowState::Redirected)?;
                tracing::debug!("Redirecting to {} for backend {}", url.origin().ascii_serialization(), self.name);
                Ok(url)
            }
            Err(err) => {
                flow.fail(&err);
                Err(err)
            }
        }
    }

    async fn complete(&self, params: &CallbackParams, session: &dyn Session) -> AuthResult<AuthResponse> {
        let mut flow = OidcFlow::redirected();
        let result = self.handle_callback(&mut flow, params, session).await;
        if let Err(err) = &result {
            flow.fail(err);
        }
        result
    }

    fn auth_allowed(&self, _response: &AuthResponse, details: &Map<String, Value>) -> bool {
        email_allowed(
            details.get("email").and_then(Value::as_str),
            &self.settings.whitelisted_domains,
            &self.settings.whitelisted_emails,
        )
    }
}

fn parse_url(field: &str, value: &str) -> AuthResult<Url> {
    Url::parse(value).map_err(|e| AuthError::configuration(format!("invalid {field} {value:?}: {e}")))
}
