//! Provider JWKS fetching and caching.
//!
//! Key sets are fetched from the provider's `jwks_uri`, cached for a fixed TTL
//! (24 hours by default) and looked up by `kid`. The token validator forces a
//! single refresh when a token names a key the cached set does not contain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::Algorithm;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the key set cache.
#[derive(Debug, Clone)]
pub struct KeySetCacheConfig {
    /// Time-to-live for cached key sets (default: 24 hours).
    pub ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs.
    /// This should only be enabled for testing.
    pub allow_http: bool,
}

impl Default for KeySetCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            request_timeout: Duration::from_secs(10),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl KeySetCacheConfig {
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

    /// Allows HTTP (non-HTTPS) JWKS URIs. Test use only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur while fetching or using a key set.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// The JWKS endpoint could not be reached.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The endpoint returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The response body is not a valid JWK set.
    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),

    /// The key set holds no usable signing key.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The key material could not be turned into a verification key.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The JWKS URI scheme is not allowed.
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

/// An immutable, ordered set of provider keys.
#[derive(Debug, Clone)]
pub struct KeySet {
    jwks: JwkSet,
}

impl KeySet {
    /// Wraps a parsed JWK set.
    #[must_use]
    pub fn new(jwks: JwkSet) -> Self {
        Self { jwks }
    }

    /// Returns the number of keys, including encryption keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jwks.keys.len()
    }

    /// Returns `true` if the set has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jwks.keys.is_empty()
    }

    /// Returns `true` if a key with this `kid` is present.
    #[must_use]
    pub fn contains_kid(&self, kid: &str) -> bool {
        self.jwks
            .keys
            .iter()
            .any(|k| k.common.key_id.as_deref() == Some(kid))
    }

    /// Returns the signing keys a token with the given `kid` may have been
    /// signed with: the exact match when `kid` is set, otherwise every key.
    /// Keys marked for encryption are never candidates.
    pub fn candidates<'a>(&'a self, kid: Option<&'a str>) -> impl Iterator<Item = &'a Jwk> + 'a {
        self.jwks
            .keys
            .iter()
            .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .filter(move |k| match kid {
                Some(kid) => k.common.key_id.as_deref() == Some(kid),
                None => true,
            })
    }
}

struct CachedKeySet {
    keys: Arc<KeySet>,
    expires_at: Instant,
}

/// Cache of provider key sets keyed by JWKS URI.
pub struct KeySetCache {
    http_client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedKeySet>>>,
    config: KeySetCacheConfig,
}

impl KeySetCache {
    /// Creates a new key set cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: KeySetCacheConfig) -> Result<Self, JwksError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JwksError::ClientError(e.to_string()))?;

        Ok(Self {
            http_client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// Returns the cached key set, fetching it when absent or expired.
    pub async fn get(&self, jwks_uri: &Url) -> Result<Arc<KeySet>, JwksError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&normalize_uri(jwks_uri))
                && Instant::now() < cached.expires_at
            {
                tracing::trace!("Cache hit for JWKS: {}", jwks_uri);
                return Ok(Arc::clone(&cached.keys));
            }
        }

        self.refresh(jwks_uri).await
    }

    /// Fetches the key set and replaces the cached entry.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The URI scheme is not HTTPS (unless `allow_http` is configured)
    /// - The HTTP request fails
    /// - The response cannot be parsed as a JWK set
    pub async fn refresh(&self, jwks_uri: &Url) -> Result<Arc<KeySet>, JwksError> {
        self.validate_scheme(jwks_uri)?;

        tracing::debug!("Fetching JWKS from {}", jwks_uri);

        let response = self
            .http_client
            .get(jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch JWKS from {}: {}", jwks_uri, e);
                JwksError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let jwks: JwkSet = response.json().await.map_err(|e| {
            tracing::warn!("Failed to parse JWKS from {}: {}", jwks_uri, e);
            JwksError::ParseError(e.to_string())
        })?;

        tracing::debug!("Cached JWKS from {} with {} keys", jwks_uri, jwks.keys.len());

        let keys = Arc::new(KeySet::new(jwks));
        self.store(jwks_uri, Arc::clone(&keys)).await;
        Ok(keys)
    }

    /// Inserts a key set without fetching it.
    pub async fn insert(&self, jwks_uri: &Url, jwks: JwkSet) {
        self.store(jwks_uri, Arc::new(KeySet::new(jwks))).await;
    }

    async fn store(&self, jwks_uri: &Url, keys: Arc<KeySet>) {
        self.cache.write().await.insert(
            normalize_uri(jwks_uri),
            CachedKeySet {
                keys,
                expires_at: Instant::now() + self.config.ttl,
            },
        );
    }

    fn validate_scheme(&self, uri: &Url) -> Result<(), JwksError> {
        match uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            other => Err(JwksError::InvalidScheme(other.to_string())),
        }
    }

    /// Removes the cached key set so the next `get` fetches again.
    pub async fn invalidate(&self, jwks_uri: &Url) {
        self.cache.write().await.remove(&normalize_uri(jwks_uri));
        tracing::debug!("Invalidated JWKS cache for {}", jwks_uri);
    }

    /// Drops expired entries.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| now < v.expires_at);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!("Cleaned up {} expired JWKS cache entries", removed);
        }
    }

    /// Drops all entries.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Returns the number of cached key sets.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

fn normalize_uri(uri: &Url) -> String {
    uri.as_str().trim_end_matches('/').to_string()
}

/// Returns the algorithm declared on a JWK, if it is a signing algorithm.
#[must_use]
pub fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
