//! ID token validation.
//!
//! Validation runs in a fixed order and stops at the first failure:
//!
//! 1. Read `kid` from the unverified header.
//! 2. Pick candidate keys from the cached JWKS, refreshing the set once if
//!    `kid` is unknown.
//! 3. Verify the signature against each candidate until one matches.
//! 4. Decode with audience, issuer and expiry checks under the configured leeway.
//! 5. Compare `at_hash` with the access token, when present.
//! 6. Check `nbf` and the `iat` age, then redeem the nonce.
//!
//! Claims are only returned once every step has passed.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use time::OffsetDateTime;
use url::Url;

use crate::error::AuthError;
use crate::jwks::{KeySetCache, jwk_algorithm};
use crate::replay::NonceGuard;
use crate::AuthResult;

use super::claims::{IdTokenClaims, compute_at_hash};

/// Per-provider inputs to [`TokenValidator::validate`].
#[derive(Debug, Clone)]
pub struct ValidationParams<'a> {
    /// Expected audience.
    pub client_id: &'a str,
    /// Expected issuer.
    pub issuer: &'a str,
    /// Where the provider publishes its keys.
    pub jwks_uri: &'a Url,
    /// Authorization URL the nonce was issued under.
    pub authorization_url: &'a str,
    /// Accepted algorithms; the first is assumed for keys without `alg`.
    pub algorithms: &'a [Algorithm],
    /// Leeway for the expiry and audience-time checks.
    pub leeway: Duration,
    /// Maximum age of `iat`.
    pub max_age: Duration,
}

/// Verifies ID tokens against provider keys and redeems their nonces.
#[derive(Clone)]
pub struct TokenValidator {
    keys: Arc<KeySetCache>,
    nonces: NonceGuard,
}

impl TokenValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(keys: Arc<KeySetCache>, nonces: NonceGuard) -> Self {
        Self { keys, nonces }
    }

    /// Validates `id_token` and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns a `Token` error describing the first failed check, a
    /// `Connection` error if the JWKS cannot be fetched, or a `Configuration`
    /// error if no algorithm is configured.
    pub async fn validate(
        &self,
        id_token: &str,
        access_token: &str,
        params: &ValidationParams<'_>,
    ) -> AuthResult<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| AuthError::token(format!("Invalid token header: {e}")))?;

        let (key, key_alg) = self.find_valid_key(id_token, &header, params).await?;

        let claims = decode_claims(id_token, &header, &key, params)?;

        if let Some(at_hash) = &claims.at_hash
            && *at_hash != compute_at_hash(access_token, key_alg)?
        {
            tracing::warn!("ID token at_hash does not match the access token");
            return Err(AuthError::token("Invalid access token"));
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        check_time_window(&claims, now, params.max_age)?;

        let nonce = claims
            .nonce
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AuthError::token("Incorrect id_token: nonce"))?;
        self.nonces.redeem(params.authorization_url, nonce).await?;

        tracing::debug!("Validated ID token for subject {}", claims.sub);
        Ok(claims)
    }

    /// Finds the key that produced the token's signature.
    ///
    /// An unknown `kid` triggers exactly one forced JWKS refresh.
    async fn find_valid_key(
        &self,
        id_token: &str,
        header: &Header,
        params: &ValidationParams<'_>,
    ) -> AuthResult<(DecodingKey, Algorithm)> {
        let default_alg = *params
            .algorithms
            .first()
            .ok_or_else(|| AuthError::configuration("JWT_ALGORITHMS must not be empty"))?;
        let kid = header.kid.as_deref();

        let mut keys = self.keys.get(params.jwks_uri).await?;
        if let Some(kid) = kid
            && !keys.contains_kid(kid)
        {
            tracing::debug!("Key {} not in cached JWKS, refreshing {}", kid, params.jwks_uri);
            self.keys.invalidate(params.jwks_uri).await;
            keys = self.keys.get(params.jwks_uri).await?;
        }

        for jwk in keys.candidates(kid) {
            let alg = jwk_algorithm(jwk).unwrap_or(default_alg);
            let key = match DecodingKey::from_jwk(jwk) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!("Skipping unusable JWK {:?}: {}", jwk.common.key_id, e);
                    continue;
                }
            };
            if signature_matches(id_token, &key, alg) {
                return Ok((key, alg));
            }
        }

        tracing::warn!("No JWKS key verifies the ID token signature (kid {:?})", kid);
        Err(AuthError::token("Signature verification failed"))
    }
}

/// Checks the signature alone, ignoring every claim.
fn signature_matches(id_token: &str, key: &DecodingKey, alg: Algorithm) -> bool {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<serde_json::Value>(id_token, key, &validation).is_ok()
}

/// Decodes the claims with the standard JWT checks.
fn decode_claims(
    id_token: &str,
    header: &Header,
    key: &DecodingKey,
    params: &ValidationParams<'_>,
) -> AuthResult<IdTokenClaims> {
    if !params.algorithms.contains(&header.alg) {
        return Err(AuthError::token("The specified alg value is not allowed"));
    }

    let mut validation = Validation::new(header.alg);
    validation.set_audience(&[params.client_id]);
    validation.set_issuer(&[params.issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
    validation.leeway = leeway_secs(params.leeway);

    jsonwebtoken::decode::<IdTokenClaims>(id_token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            let message = match e.kind() {
                ErrorKind::ExpiredSignature => "Signature has expired".to_string(),
                ErrorKind::InvalidAudience => "Invalid audience".to_string(),
                ErrorKind::InvalidIssuer => "Invalid issuer".to_string(),
                ErrorKind::ImmatureSignature => "The token is not yet valid (nbf)".to_string(),
                ErrorKind::InvalidSignature => "Invalid signature".to_string(),
                ErrorKind::MissingRequiredClaim(claim) => {
                    format!("Token is missing the \"{claim}\" claim")
                }
                _ => e.to_string(),
            };
            tracing::warn!("ID token rejected: {}", message);
            AuthError::token(message)
        })
}

/// Rejects tokens that are not yet valid or were issued too long ago.
///
/// Both checks compare against `now` without leeway.
pub fn check_time_window(claims: &IdTokenClaims, now: i64, max_age: Duration) -> AuthResult<()> {
    if let Some(nbf) = claims.nbf
        && now < nbf
    {
        return Err(AuthError::token("Incorrect id_token: nbf"));
    }

    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    if now > claims.iat.saturating_add(max_age) {
        return Err(AuthError::token("Incorrect id_token: iat"));
    }

    Ok(())
}

/// Converts a leeway to whole seconds, rounding up.
fn leeway_secs(leeway: Duration) -> u64 {
    leeway.as_secs() + u64::from(leeway.subsec_nanos() > 0)
}
