//! OAuth 2.0 plumbing shared by code-flow backends.
//!
//! Covers provider error callbacks, the authorization-code exchange, token
//! revocation and the userinfo request.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::AuthError;
use crate::AuthResult;

/// Query or form parameters received on the callback URL.
pub type CallbackParams = HashMap<String, String>;

/// How client credentials are sent to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    /// HTTP Basic `Authorization` header (`client_secret_basic`).
    Basic,
    /// `client_id` and `client_secret` form fields (`client_secret_post`).
    Post,
}

impl ClientAuthMethod {
    /// Picks the method from an explicit setting, falling back to what the
    /// provider advertises.
    #[must_use]
    pub fn resolve(configured: Option<&str>, prefers_basic: impl FnOnce() -> bool) -> Self {
        match configured {
            Some(method) if method == "client_secret_basic" => Self::Basic,
            Some(_) => Self::Post,
            None if prefers_basic() => Self::Basic,
            None => Self::Post,
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Provider-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reads `expires_in` sent as a number or as a numeric string.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Fractional(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(secs)) => Ok(Some(secs)),
        Some(Raw::Fractional(secs)) if secs.is_finite() && secs >= 0.0 => Ok(Some(secs as u64)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text.trim().parse().map(Some).map_err(|_| {
            serde::de::Error::custom(format!("expires_in is not a number of seconds: {text}"))
        }),
        Some(Raw::Fractional(secs)) => Err(serde::de::Error::custom(format!(
            "expires_in must be non-negative, got {secs}"
        ))),
    }
}

/// OAuth error body returned by a provider.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Turns an error reported on the callback into the matching [`AuthError`].
///
/// `error=access_denied` (or any error mentioning `denied`/`cancelled`) and a
/// bare `denied` parameter mean the user backed out; any other error is a
/// provider-side failure.
pub fn process_error(params: &CallbackParams) -> AuthResult<()> {
    if let Some(error) = params.get("error") {
        return Err(classify_error(error, params.get("error_description").map(String::as_str)));
    }
    if params.contains_key("denied") {
        return Err(AuthError::canceled(params.get("denied").cloned()));
    }
    Ok(())
}

fn classify_error(error: &str, description: Option<&str>) -> AuthError {
    if error.contains("denied") || error.contains("cancelled") {
        AuthError::canceled(description.map(str::to_string))
    } else {
        AuthError::failed(description.filter(|d| !d.is_empty()).unwrap_or(error))
    }
}

/// HTTP client for token, revocation and userinfo endpoints.
#[derive(Clone)]
pub struct TokenClient {
    http_client: reqwest::Client,
}

impl TokenClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("HTTP client error: {e}")))?;
        Ok(Self { http_client })
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the endpoint is unreachable, `Canceled` or
    /// `Failed` if the provider rejects the exchange, and `Failed` if the
    /// body cannot be parsed.
    pub async fn exchange_code(
        &self,
        token_endpoint: &Url,
        code: &str,
        redirect_uri: &str,
        client_id: &str,
        client_secret: &str,
        auth_method: ClientAuthMethod,
    ) -> AuthResult<TokenResponse> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if auth_method == ClientAuthMethod::Post {
            params.push(("client_id", client_id));
            params.push(("client_secret", client_secret));
        }

        tracing::debug!("Exchanging authorization code at {}", token_endpoint);

        let mut request = self
            .http_client
            .post(token_endpoint.as_str())
            .header("Accept", "application/json")
            .form(&params);
        if auth_method == ClientAuthMethod::Basic {
            request = request.basic_auth(client_id, Some(client_secret));
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!("Token endpoint {} unreachable: {}", token_endpoint, e);
            AuthError::connection(e.to_string())
        })?;

        let body = read_success_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| AuthError::failed(format!("Failed to parse token response: {e}")))
    }

    /// Revokes a token at the provider.
    pub async fn revoke_token(
        &self,
        revocation_endpoint: &Url,
        token: &str,
        client_id: &str,
        client_secret: &str,
        auth_method: ClientAuthMethod,
    ) -> AuthResult<()> {
        let mut params = vec![("token", token)];
        if auth_method == ClientAuthMethod::Post {
            params.push(("client_id", client_id));
            params.push(("client_secret", client_secret));
        }

        let mut request = self
            .http_client
            .post(revocation_endpoint.as_str())
            .form(&params);
        if auth_method == ClientAuthMethod::Basic {
            request = request.basic_auth(client_id, Some(client_secret));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::connection(e.to_string()))?;
        read_success_body(response).await?;

        tracing::debug!("Revoked token at {}", revocation_endpoint);
        Ok(())
    }

    /// Fetches the userinfo document with a bearer access token.
    pub async fn fetch_userinfo(
        &self,
        userinfo_endpoint: &Url,
        access_token: &str,
    ) -> AuthResult<Map<String, Value>> {
        let response = self
            .http_client
            .get(userinfo_endpoint.as_str())
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::connection(e.to_string()))?;

        let body = read_success_body(response).await?;
        serde_json::from_str(&body)
            .map_err(|e| AuthError::failed(format!("Failed to parse userinfo response: {e}")))
    }
}

/// Returns the body of a successful response or the provider's error.
async fn read_success_body(response: reqwest::Response) -> AuthResult<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AuthError::connection(e.to_string()))?;

    if status.is_success() {
        return Ok(body);
    }

    if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
        return Err(classify_error(
            &oauth_error.error,
            oauth_error.error_description.as_deref(),
        ));
    }

    Err(AuthError::failed(format!("HTTP {status}")))
}
