//! Authentication error types.
//!
//! Every failure the core can raise is a variant of [`AuthError`]. Errors are
//! always returned to the immediate caller; nothing inside the crate retries
//! or swallows them.

use std::fmt;

use crate::discovery::DiscoveryError;
use crate::jwks::JwksError;

/// Errors that can occur while authenticating against a provider.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A required setting or request parameter is absent or structurally invalid.
    #[error("Missing needed parameter {name}")]
    MissingParameter {
        /// Name or description of the missing parameter.
        name: String,
    },

    /// A parameter is present but its value is not acceptable.
    #[error("Invalid value for parameter {name}")]
    InvalidParameter {
        /// Name of the offending parameter.
        name: String,
    },

    /// A recognized optional parameter that this crate does not support was supplied.
    #[error("Not implemented parameter {name}")]
    NotImplementedParameter {
        /// Name of the unsupported parameter.
        name: String,
    },

    /// The ID token failed signature or claim validation.
    #[error("Token error: {message}")]
    Token {
        /// What was wrong with the token.
        message: String,
    },

    /// The user or provider canceled the authentication.
    #[error("Authentication process canceled{}", fmt_suffix(.message))]
    Canceled {
        /// Optional description reported by the provider.
        message: Option<String>,
    },

    /// The provider rejected the authentication.
    #[error("Authentication failed: {message}")]
    Failed {
        /// Description reported by the provider.
        message: String,
    },

    /// A provider endpoint could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the transport failure.
        message: String,
    },

    /// Provider metadata could not be obtained or is malformed.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No override, backend default or discovered value exists for a field.
    #[error("Missing needed configuration {field}")]
    MissingConfiguration {
        /// Setting name that could not be resolved.
        field: String,
    },

    /// The session holds no state value for this backend.
    #[error("Session value state missing.")]
    StateMissing,

    /// The state returned by the provider does not match the session value.
    #[error("Wrong state parameter given.")]
    StateForbidden,

    /// The authenticated identity is not allowed to log in.
    #[error("Your credentials aren't allowed")]
    Forbidden,

    /// The social account already belongs to another user.
    #[error("This account is already in use.")]
    AlreadyAssociated,

    /// No backend is registered under the requested name.
    #[error("Missing backend \"{name}\" entry")]
    MissingBackend {
        /// Requested backend name.
        name: String,
    },

    /// A storage backend operation failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The pipeline could not be built or executed.
    #[error("Pipeline error: {message}")]
    Pipeline {
        /// Description of the pipeline failure.
        message: String,
    },
}

fn fmt_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(": {m}"),
        _ => String::new(),
    }
}

impl AuthError {
    /// Creates a new `MissingParameter` error.
    #[must_use]
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Creates a new `InvalidParameter` error.
    #[must_use]
    pub fn invalid_parameter(name: impl Into<String>) -> Self {
        Self::InvalidParameter { name: name.into() }
    }

    /// Creates a new `NotImplementedParameter` error.
    #[must_use]
    pub fn not_implemented_parameter(name: impl Into<String>) -> Self {
        Self::NotImplementedParameter { name: name.into() }
    }

    /// Creates a new `Token` error.
    #[must_use]
    pub fn token(message: impl Into<String>) -> Self {
        Self::Token {
            message: message.into(),
        }
    }

    /// Creates a new `Canceled` error.
    #[must_use]
    pub fn canceled(message: Option<String>) -> Self {
        Self::Canceled { message }
    }

    /// Creates a new `Failed` error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `MissingConfiguration` error.
    #[must_use]
    pub fn missing_configuration(field: impl Into<String>) -> Self {
        Self::MissingConfiguration {
            field: field.into(),
        }
    }

    /// Creates a new `MissingBackend` error.
    #[must_use]
    pub fn missing_backend(name: impl Into<String>) -> Self {
        Self::MissingBackend { name: name.into() }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Pipeline` error.
    #[must_use]
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Returns `true` if this error concerns a setting or request parameter.
    #[must_use]
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::NotImplementedParameter { .. }
        )
    }

    /// Returns `true` if this is an ID token validation failure.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::Token { .. })
    }

    /// Returns `true` if this error originated on the provider side.
    #[must_use]
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::Canceled { .. } | Self::Failed { .. } | Self::Connection { .. }
        )
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingParameter { .. }
            | Self::InvalidParameter { .. }
            | Self::NotImplementedParameter { .. } => ErrorCategory::Validation,
            Self::Token { .. } => ErrorCategory::Token,
            Self::Canceled { .. } | Self::Failed { .. } => ErrorCategory::Provider,
            Self::Connection { .. } => ErrorCategory::Transport,
            Self::Configuration { .. }
            | Self::MissingConfiguration { .. }
            | Self::MissingBackend { .. } => ErrorCategory::Configuration,
            Self::StateMissing | Self::StateForbidden => ErrorCategory::AntiReplay,
            Self::Forbidden | Self::AlreadyAssociated => ErrorCategory::Authorization,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Pipeline { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<DiscoveryError> for AuthError {
    fn from(err: DiscoveryError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<JwksError> for AuthError {
    fn from(err: JwksError) -> Self {
        match err {
            JwksError::NetworkError(_) | JwksError::HttpError(_) => {
                Self::connection(err.to_string())
            }
            JwksError::InvalidScheme(_) => Self::configuration(err.to_string()),
            _ => Self::token(err.to_string()),
        }
    }
}

/// Categories of authentication errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad settings or request parameters.
    Validation,
    /// ID token signature or claim failures.
    Token,
    /// Provider-reported cancellations and rejections.
    Provider,
    /// Network failures reaching the provider.
    Transport,
    /// Missing or malformed configuration.
    Configuration,
    /// State or nonce mismatches.
    AntiReplay,
    /// The identity is not allowed to log in.
    Authorization,
    /// Storage failures.
    Infrastructure,
    /// Pipeline wiring errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Token => write!(f, "token"),
            Self::Provider => write!(f, "provider"),
            Self::Transport => write!(f, "transport"),
            Self::Configuration => write!(f, "configuration"),
            Self::AntiReplay => write!(f, "anti_replay"),
            Self::Authorization => write!(f, "authorization"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
