//! OpenID Connect provider metadata discovery and caching.
//!
//! Provider metadata is fetched from `{endpoint}/.well-known/openid-configuration`
//! and kept for a fixed TTL (24 hours by default). Entries are replaced wholesale
//! on expiry or explicit invalidation; there is no background refresh.
//!
//! # Example
//!
//! ```ignore
//! use socialauth::discovery::{DiscoveryCache, DiscoveryCacheConfig};
//! use url::Url;
//!
//! let cache = DiscoveryCache::new(DiscoveryCacheConfig::default())?;
//! let endpoint = Url::parse("https://accounts.example.com")?;
//! let metadata = cache.get(&endpoint).await?;
//! println!("Token endpoint: {:?}", metadata.token_endpoint);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the provider metadata cache.
#[derive(Debug, Clone)]
pub struct DiscoveryCacheConfig {
    /// Time-to-live for cached metadata (default: 24 hours).
    pub ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) endpoints.
    /// This should only be enabled for testing.
    pub allow_http: bool,

    /// Whether the advertised issuer must equal the discovery endpoint.
    pub require_issuer_match: bool,
}

impl Default for DiscoveryCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
            require_issuer_match: false,
        }
    }
}

impl DiscoveryCacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum response size.
    #[must_use]
    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Allows HTTP (non-HTTPS) endpoints. Test use only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Requires the advertised issuer to match the discovery endpoint.
    #[must_use]
    pub fn with_require_issuer_match(mut self, require: bool) -> Self {
        self.require_issuer_match = require;
        self
    }
}

/// Errors that can occur during provider discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The metadata endpoint could not be reached.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The endpoint returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The response body is not a valid metadata document.
    #[error("Failed to parse provider metadata: {0}")]
    ParseError(String),

    /// A field of the metadata document holds an unusable value.
    #[error("Invalid metadata field {field}: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The advertised issuer differs from the discovery endpoint.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// The discovery endpoint.
        expected: String,
        /// The issuer advertised by the document.
        actual: String,
    },

    /// The endpoint scheme is not allowed.
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// The HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    ClientError(String),
}

/// Provider metadata advertised at the discovery endpoint.
///
/// Endpoints other than `issuer` are optional here because each of them can
/// also be supplied through settings; the flow controller reports a missing
/// configuration when no tier provides one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier.
    pub issuer: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Client authentication methods accepted at the token endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProviderMetadata {
    /// Creates metadata with only an issuer set.
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            jwks_uri: None,
            revocation_endpoint: None,
            end_session_endpoint: None,
            token_endpoint_auth_methods_supported: Vec::new(),
            scopes_supported: Vec::new(),
            response_types_supported: Vec::new(),
            id_token_signing_alg_values_supported: Vec::new(),
            extra: HashMap::new(),
        }
    }

    /// Returns `true` if `client_secret_basic` should be used at the token endpoint.
    ///
    /// Providers that do not advertise their methods get Basic auth, which is
    /// the OAuth 2.0 default.
    #[must_use]
    pub fn prefers_basic_auth(&self) -> bool {
        self.token_endpoint_auth_methods_supported.is_empty()
            || self
                .token_endpoint_auth_methods_supported
                .iter()
                .any(|m| m == "client_secret_basic")
    }

    /// Rejects documents whose required fields are empty or whose endpoints
    /// are not absolute URLs.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.issuer.trim().is_empty() {
            return Err(DiscoveryError::InvalidField {
                field: "issuer",
                reason: "must not be empty".into(),
            });
        }

        let endpoints = [
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
            ("userinfo_endpoint", &self.userinfo_endpoint),
            ("jwks_uri", &self.jwks_uri),
            ("revocation_endpoint", &self.revocation_endpoint),
            ("end_session_endpoint", &self.end_session_endpoint),
        ];
        for (field, value) in endpoints {
            if let Some(url) = value
                && let Err(e) = Url::parse(url)
            {
                return Err(DiscoveryError::InvalidField {
                    field,
                    reason: e.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Client for fetching provider metadata documents.
pub struct DiscoveryClient {
    http_client: reqwest::Client,
    config: DiscoveryCacheConfig,
}

impl DiscoveryClient {
    /// Creates a new discovery client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: DiscoveryCacheConfig) -> Result<Self, DiscoveryError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DiscoveryError::ClientError(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// Fetches and validates the metadata document for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The endpoint is not HTTPS (unless `allow_http` is set)
    /// - The document cannot be fetched or parsed
    /// - A field of the document is unusable
    /// - Issuer matching is required and the issuer differs
    pub async fn discover(&self, endpoint: &Url) -> Result<ProviderMetadata, DiscoveryError> {
        self.validate_scheme(endpoint)?;

        let discovery_url = build_discovery_url(endpoint);

        let response = self
            .http_client
            .get(discovery_url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch provider metadata from {}: {}", endpoint, e);
                DiscoveryError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let metadata: ProviderMetadata = response.json().await.map_err(|e| {
            tracing::warn!("Failed to parse provider metadata from {}: {}", endpoint, e);
            DiscoveryError::ParseError(e.to_string())
        })?;

        metadata.validate()?;

        if self.config.require_issuer_match {
            let expected = normalize_key(endpoint);
            let actual = metadata.issuer.trim_end_matches('/');
            if expected != actual {
                return Err(DiscoveryError::IssuerMismatch {
                    expected,
                    actual: actual.to_string(),
                });
            }
        }

        tracing::debug!("Discovered provider metadata for {}", metadata.issuer);

        Ok(metadata)
    }

    fn validate_scheme(&self, endpoint: &Url) -> Result<(), DiscoveryError> {
        match endpoint.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}

/// Builds `{endpoint}/.well-known/openid-configuration`.
fn build_discovery_url(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    let path = endpoint.path().trim_end_matches('/');
    url.set_path(&format!("{path}/.well-known/openid-configuration"));
    url
}

struct CachedMetadata {
    metadata: Arc<ProviderMetadata>,
    fetched_at: Instant,
}

/// In-memory cache of provider metadata keyed by discovery endpoint.
///
/// Concurrent misses for the same endpoint may fetch twice; the last write wins.
pub struct DiscoveryCache {
    client: DiscoveryClient,
    cache: Arc<RwLock<HashMap<String, CachedMetadata>>>,
    config: DiscoveryCacheConfig,
}

impl DiscoveryCache {
    /// Creates a new metadata cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: DiscoveryCacheConfig) -> Result<Self, DiscoveryError> {
        Ok(Self {
            client: DiscoveryClient::new(config.clone())?,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// Returns cached metadata, fetching it when absent or expired.
    pub async fn get(&self, endpoint: &Url) -> Result<Arc<ProviderMetadata>, DiscoveryError> {
        let key = normalize_key(endpoint);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.fetched_at.elapsed() < self.config.ttl {
                    tracing::trace!("Cache hit for provider metadata: {}", endpoint);
                    return Ok(Arc::clone(&cached.metadata));
                }
                tracing::trace!("Cache expired for provider metadata: {}", endpoint);
            }
        }

        self.refresh(endpoint).await
    }

    /// Fetches fresh metadata and replaces the cached entry.
    pub async fn refresh(&self, endpoint: &Url) -> Result<Arc<ProviderMetadata>, DiscoveryError> {
        tracing::debug!("Fetching provider metadata from {}", endpoint);
        let metadata = Arc::new(self.client.discover(endpoint).await?);

        self.cache.write().await.insert(
            normalize_key(endpoint),
            CachedMetadata {
                metadata: Arc::clone(&metadata),
                fetched_at: Instant::now(),
            },
        );

        Ok(metadata)
    }

    /// Inserts metadata without fetching it.
    pub async fn insert(&self, endpoint: &Url, metadata: ProviderMetadata) {
        self.cache.write().await.insert(
            normalize_key(endpoint),
            CachedMetadata {
                metadata: Arc::new(metadata),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Removes the cached entry so the next `get` fetches again.
    pub async fn invalidate(&self, endpoint: &Url) {
        self.cache.write().await.remove(&normalize_key(endpoint));
        tracing::debug!("Invalidated provider metadata cache for {}", endpoint);
    }

    /// Drops expired entries.
    pub async fn cleanup(&self) {
        let mut cache = self.cache.write().await;
        let ttl = self.config.ttl;
        let before = cache.len();
        cache.retain(|_, v| v.fetched_at.elapsed() < ttl);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!("Cleaned up {} expired provider metadata entries", removed);
        }
    }

    /// Drops all entries.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Returns the number of cached entries.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

fn normalize_key(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(issuer: &str) -> ProviderMetadata {
        let mut m = ProviderMetadata::new(issuer);
        m.authorization_endpoint = Some(format!("{issuer}/authorize"));
        m.token_endpoint = Some(format!("{issuer}/token"));
        m.jwks_uri = Some(format!("{issuer}/jwks"));
        m
    }

    #[test]
    fn test_config_defaults() {
        let config = DiscoveryCacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(86_400));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(!config.allow_http);
        assert!(!config.require_issuer_match);
    }

    #[test]
    fn test_build_discovery_url() {
        let url = Url::parse("https://idp.example").unwrap();
        assert_eq!(
            build_discovery_url(&url).as_str(),
            "https://idp.example/.well-known/openid-configuration"
        );

        let url = Url::parse("https://idp.example/realms/main/").unwrap();
        assert_eq!(
            build_discovery_url(&url).as_str(),
            "https://idp.example/realms/main/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_parse_metadata() {
        let doc = serde_json::json!({
            "issuer": "https://idp.example",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
            "jwks_uri": "https://idp.example/jwks",
            "token_endpoint_auth_methods_supported": ["client_secret_post"],
            "claims_supported": ["sub", "email"]
        });

        let m: ProviderMetadata = serde_json::from_value(doc).unwrap();
        assert_eq!(m.issuer, "https://idp.example");
        assert_eq!(m.userinfo_endpoint, None);
        assert!(!m.prefers_basic_auth());
        assert!(m.extra.contains_key("claims_supported"));
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_missing_issuer_fails_parse() {
        let doc = serde_json::json!({"token_endpoint": "https://idp.example/token"});
        assert!(serde_json::from_value::<ProviderMetadata>(doc).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let m = ProviderMetadata::new("  ");
        assert!(matches!(
            m.validate(),
            Err(DiscoveryError::InvalidField { field: "issuer", .. })
        ));

        let mut m = metadata("https://idp.example");
        m.jwks_uri = Some("not a url".into());
        assert!(matches!(
            m.validate(),
            Err(DiscoveryError::InvalidField { field: "jwks_uri", .. })
        ));
    }

    #[test]
    fn test_prefers_basic_auth() {
        let mut m = metadata("https://idp.example");
        assert!(m.prefers_basic_auth());

        m.token_endpoint_auth_methods_supported =
            vec!["client_secret_post".into(), "client_secret_basic".into()];
        assert!(m.prefers_basic_auth());
    }

    #[test]
    fn test_validate_scheme() {
        let client = DiscoveryClient::new(DiscoveryCacheConfig::default()).unwrap();
        assert!(client
            .validate_scheme(&Url::parse("https://idp.example").unwrap())
            .is_ok());
        assert!(matches!(
            client.validate_scheme(&Url::parse("http://idp.example").unwrap()),
            Err(DiscoveryError::InvalidScheme(_))
        ));

        let client =
            DiscoveryClient::new(DiscoveryCacheConfig::default().with_allow_http(true)).unwrap();
        assert!(client
            .validate_scheme(&Url::parse("http://idp.example").unwrap())
            .is_ok());
    }

    #[tokio::test]
    async fn test_cache_insert_and_invalidate() {
        let cache = DiscoveryCache::new(DiscoveryCacheConfig::default()).unwrap();
        let endpoint = Url::parse("https://idp.example/").unwrap();

        cache.insert(&endpoint, metadata("https://idp.example")).await;
        assert_eq!(cache.len().await, 1);

        let m = cache.get(&endpoint).await.unwrap();
        assert_eq!(m.issuer, "https://idp.example");

        cache.invalidate(&Url::parse("https://idp.example").unwrap()).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_cleanup() {
        let cache =
            DiscoveryCache::new(DiscoveryCacheConfig::default().with_ttl(Duration::ZERO)).unwrap();
        let endpoint = Url::parse("https://idp.example").unwrap();

        cache.insert(&endpoint, metadata("https://idp.example")).await;
        cache.cleanup().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn test_discovery_error_display() {
        assert_eq!(
            DiscoveryError::HttpError(404).to_string(),
            "HTTP error: status 404"
        );
        assert_eq!(
            DiscoveryError::IssuerMismatch {
                expected: "https://a".into(),
                actual: "https://b".into(),
            }
            .to_string(),
            "Issuer mismatch: expected https://a, got https://b"
        );
    }
}
