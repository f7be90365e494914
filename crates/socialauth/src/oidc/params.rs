//! Optional OpenID Connect authorization request parameters.

use crate::error::AuthError;
use crate::AuthResult;

use super::config::OidcSettings;

/// Accepted `display` values.
pub const DISPLAY_VALUES: &[&str] = &["page", "popup", "touch", "wap"];

/// Accepted `prompt` tokens.
pub const PROMPT_VALUES: &[&str] = &["none", "login", "consent", "select_account"];

/// Validates the optional parameters configured for a backend and returns
/// the ones to append to the authorization URL.
///
/// # Errors
///
/// - `MissingParameter("display")` for an empty or unknown display value
/// - `InvalidParameter("prompt")` for an empty prompt or an unknown token
/// - `InvalidParameter("max_age")` for a negative max age
/// - `NotImplementedParameter` for `ui_locales`, `id_token_hint`,
///   `login_hint` and `acr_values`
pub fn optional_params(settings: &OidcSettings) -> AuthResult<Vec<(&'static str, String)>> {
    let mut params = Vec::new();

    if let Some(display) = &settings.display {
        if display.is_empty() || !DISPLAY_VALUES.contains(&display.as_str()) {
            return Err(AuthError::missing_parameter("display"));
        }
        params.push(("display", display.clone()));
    }

    if let Some(prompt) = &settings.prompt {
        if prompt.trim().is_empty()
            || prompt
                .split_whitespace()
                .any(|token| !PROMPT_VALUES.contains(&token))
        {
            return Err(AuthError::invalid_parameter("prompt"));
        }
        params.push(("prompt", prompt.clone()));
    }

    if let Some(max_age) = settings.max_age {
        if max_age < 0 {
            return Err(AuthError::invalid_parameter("max_age"));
        }
        params.push(("max_age", max_age.to_string()));
    }

    let unsupported = [
        ("ui_locales", &settings.ui_locales),
        ("id_token_hint", &settings.id_token_hint),
        ("login_hint", &settings.login_hint),
        ("acr_values", &settings.acr_values),
    ];
    if let Some((name, _)) = unsupported.iter().find(|(_, value)| value.is_some()) {
        return Err(AuthError::not_implemented_parameter(*name));
    }

    Ok(params)
}
