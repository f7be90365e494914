//! The contract between the pipeline and an authentication provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::AuthError;
use crate::oauth2::CallbackParams;
use crate::storage::Session;
use crate::AuthResult;

/// Identity returned by a backend once the provider round trip succeeded.
///
/// `data` only ever holds validated values: for OIDC these are the verified
/// ID token claims, the userinfo document and the raw tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Name of the backend that produced the response.
    pub backend: String,
    /// Normalized identity data.
    pub data: Map<String, Value>,
}

impl AuthResponse {
    /// Returns a string field of the response.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// An authentication provider.
///
/// Backends drive the provider round trip and translate the provider's view
/// of a user into the details the pipeline steps consume.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Unique backend name, used as the provider of linked social accounts.
    fn name(&self) -> &str;

    /// Builds the URL the browser is redirected to.
    ///
    /// # Errors
    ///
    /// Returns an error if settings are missing or invalid, or if the
    /// anti-replay values cannot be stored.
    async fn auth_url(&self, session: &dyn Session) -> AuthResult<Url>;

    /// Handles the provider callback and returns the validated identity.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the callback handling; no partially
    /// validated identity is ever returned.
    async fn complete(&self, params: &CallbackParams, session: &dyn Session) -> AuthResult<AuthResponse>;

    /// Extracts user details from a response.
    ///
    /// The default implementation reads the standard OIDC claim names;
    /// claims the provider did not send become `null`.
    fn user_details(&self, response: &AuthResponse) -> Map<String, Value> {
        let mut details = Map::new();
        let copy = [
            ("username", "preferred_username"),
            ("email", "email"),
            ("fullname", "name"),
            ("first_name", "given_name"),
            ("last_name", "family_name"),
        ];
        for (detail, claim) in copy {
            let value = response
                .get_str(claim)
                .map_or(Value::Null, |v| Value::String(v.to_string()));
            details.insert(detail.to_string(), value);
        }
        details
    }

    /// Callback parameter naming the provider-side user id.
    fn id_key(&self) -> &str {
        "sub"
    }

    /// Returns the provider-side user id.
    ///
    /// # Errors
    ///
    /// Returns `MissingParameter("sub")` if the response carries no subject.
    fn user_id(&self, _details: &Map<String, Value>, response: &AuthResponse) -> AuthResult<String> {
        match response.data.get("sub") {
            Some(Value::String(sub)) if !sub.is_empty() => Ok(sub.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(AuthError::missing_parameter("sub")),
        }
    }

    /// Returns the data stored on the linked social account.
    fn extra_data(
        &self,
        response: &AuthResponse,
        _uid: &str,
        _details: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut extra = Map::new();
        for key in [
            "auth_time",
            "access_token",
            "token_type",
            "refresh_token",
            "expires_in",
            "id_token",
        ] {
            if let Some(value) = response.data.get(key).filter(|v| !v.is_null()) {
                extra.insert(key.to_string(), value.clone());
            }
        }
        extra
    }

    /// Returns `true` if the identity may log in.
    fn auth_allowed(&self, _response: &AuthResponse, _details: &Map<String, Value>) -> bool {
        true
    }
}

/// Checks an email against domain and address allow lists.
///
/// Both lists empty, or no email, means allowed.
#[must_use]
pub fn email_allowed(email: Option<&str>, domains: &[String], emails: &[String]) -> bool {
    let Some(email) = email.filter(|e| !e.is_empty()) else {
        return true;
    };
    if domains.is_empty() && emails.is_empty() {
        return true;
    }

    let email = email.to_lowercase();
    if emails.iter().any(|e| e.to_lowercase() == email) {
        return true;
    }
    email
        .rsplit_once('@')
        .is_some_and(|(_, domain)| domains.iter().any(|d| d.to_lowercase() == domain))
}
