//! End-to-end tests of the OIDC login flow against a mock provider.

mod common;

use std::sync::Arc;

use jsonwebtoken::Algorithm;
use serde_json::json;
use socialauth::oauth2::CallbackParams;
use socialauth::oidc::compute_at_hash;
use socialauth::prelude::*;
use socialauth::replay::StateGuard;
use socialauth_memory::{MemoryNonceStore, MemoryPartialStore, MemorySession, MemoryUserStore};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{K1_N, K1_PEM, K2_N, K2_PEM, MockProvider};

/// Starts a login and returns the `state` and `nonce` sent to the provider.
async fn begin(backend: &OidcBackend, session: &MemorySession) -> (Url, String, String) {
    let url = backend.auth_url(session).await.unwrap();
    let state = common::query_param(&url, "state").unwrap();
    let nonce = common::query_param(&url, "nonce").unwrap();
    (url, state, nonce)
}

fn callback(code: &str, state: &str) -> CallbackParams {
    CallbackParams::from([
        ("code".to_string(), code.to_string()),
        ("state".to_string(), state.to_string()),
    ])
}

fn id_token_for(nonce: &str, iat: i64, access_token: &str) -> String {
    let mut claims = common::claims(nonce, iat);
    claims["at_hash"] = json!(compute_at_hash(access_token, Algorithm::RS256).unwrap());
    common::sign(&claims, "K1", K1_PEM)
}

#[tokio::test]
async fn test_authorization_url() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (url, state, nonce) = begin(&backend, &session).await;

    assert!(url.as_str().starts_with(&provider.authorization_url()));
    assert_eq!(common::query_param(&url, "response_type").as_deref(), Some("code"));
    assert_eq!(common::query_param(&url, "client_id").as_deref(), Some(common::CLIENT_ID));
    assert_eq!(
        common::query_param(&url, "redirect_uri").as_deref(),
        Some(common::REDIRECT_URI)
    );
    assert_eq!(
        common::query_param(&url, "scope").as_deref(),
        Some("openid profile email")
    );
    assert_eq!(
        session.get(&StateGuard::session_key("oidc")).await.unwrap(),
        Some(state)
    );
    assert_eq!(nonces.len(), 1);
    assert!(
        nonces
            .get(&provider.authorization_url(), &nonce)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_complete_login() {
    common::init_tracing();
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let settings = provider.settings();
    let backend = common::backend(&settings, Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    let id_token = id_token_for(&nonce, common::now(), "tok");
    provider.mount_token("abc123", &id_token, "tok").await;

    let response = backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap();

    assert_eq!(response.backend, "oidc");
    assert_eq!(response.get_str("sub"), Some("user-1"));
    assert_eq!(response.get_str("access_token"), Some("tok"));
    assert_eq!(response.get_str("id_token"), Some(id_token.as_str()));
    assert_eq!(response.get_str("token_type"), Some("Bearer"));
    assert_eq!(response.data["expires_in"], 3600);
    assert!(nonces.is_empty());
}

#[tokio::test]
async fn test_complete_through_service_creates_user() {
    common::init_tracing();
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let users = Arc::new(MemoryUserStore::new());
    let settings = provider.settings();
    let service = SocialAuthService::new(
        settings.clone(),
        Arc::clone(&users) as Arc<dyn UserStore>,
        Arc::new(MemoryPartialStore::new()),
    )
    .unwrap();
    service
        .register_backend(Arc::new(common::backend(&settings, Arc::clone(&nonces))))
        .await;
    let session = MemorySession::new();

    let url = service.begin("oidc", &session).await.unwrap();
    let state = common::query_param(&url, "state").unwrap();
    let nonce = common::query_param(&url, "nonce").unwrap();
    provider
        .mount_token("abc123", &id_token_for(&nonce, common::now(), "tok"), "tok")
        .await;

    let outcome = service
        .complete("oidc", &callback("abc123", &state), &session)
        .await
        .unwrap();

    let AuthOutcome::Authenticated {
        user,
        social,
        is_new,
        ..
    } = outcome
    else {
        panic!("expected an authenticated outcome, got {outcome:?}");
    };
    assert!(is_new);
    assert_eq!(user.username, "jdoe");
    assert_eq!(user.email.as_deref(), Some("jdoe@example.com"));
    assert_eq!(user.first_name.as_deref(), Some("John"));
    assert_eq!(user.last_name.as_deref(), Some("Doe"));

    let social = social.unwrap();
    assert_eq!(social.uid, "user-1");
    assert_eq!(social.extra_data["access_token"], "tok");
    assert_eq!(users.user_count(), 1);
    assert!(nonces.is_empty());
}

#[tokio::test]
async fn test_nonce_is_single_use() {
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    provider
        .mount_token("abc123", &id_token_for(&nonce, common::now(), "tok"), "tok")
        .await;

    backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap();
    let err = backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Token { .. }));
    assert_eq!(err.to_string(), "Token error: Incorrect id_token: nonce");
}

#[tokio::test]
async fn test_iat_window() {
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    provider
        .mount_token("stale", &id_token_for(&nonce, common::now() - 601, "tok"), "tok")
        .await;
    let err = backend
        .complete(&callback("stale", &state), &session)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Token error: Incorrect id_token: iat");

    let (_, state, nonce) = begin(&backend, &session).await;
    provider
        .mount_token("fresh", &id_token_for(&nonce, common::now() - 599, "tok"), "tok")
        .await;
    let response = backend
        .complete(&callback("fresh", &state), &session)
        .await
        .unwrap();
    assert_eq!(response.get_str("sub"), Some("user-1"));
}

#[tokio::test]
async fn test_key_rotation_refetches_once() {
    common::init_tracing();
    let provider = MockProvider::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "keys": [common::rsa_jwk("K1", K1_N)] })),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&provider.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [common::rsa_jwk("K1", K1_N), common::rsa_jwk("K2", K2_N)]
        })))
        .expect(1)
        .mount(&provider.server)
        .await;

    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    // Warm the cache with the old key set.
    let (_, state, nonce) = begin(&backend, &session).await;
    provider
        .mount_token("old", &id_token_for(&nonce, common::now(), "tok"), "tok")
        .await;
    backend
        .complete(&callback("old", &state), &session)
        .await
        .unwrap();

    let (_, state, nonce) = begin(&backend, &session).await;
    let mut claims = common::claims(&nonce, common::now());
    claims["at_hash"] = json!(compute_at_hash("tok", Algorithm::RS256).unwrap());
    provider
        .mount_token("rotated", &common::sign(&claims, "K2", K2_PEM), "tok")
        .await;

    let response = backend
        .complete(&callback("rotated", &state), &session)
        .await
        .unwrap();
    assert_eq!(response.get_str("sub"), Some("user-1"));

    provider.server.verify().await;
}

#[tokio::test]
async fn test_unknown_kid_fails_after_one_refetch() {
    let provider = MockProvider::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "keys": [common::rsa_jwk("K1", K1_N)] })),
        )
        .expect(2)
        .mount(&provider.server)
        .await;

    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    let mut claims = common::claims(&nonce, common::now());
    claims["at_hash"] = json!(compute_at_hash("tok", Algorithm::RS256).unwrap());
    provider
        .mount_token("abc123", &common::sign(&claims, "K9", K2_PEM), "tok")
        .await;

    let err = backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Token error: Signature verification failed");

    provider.server.verify().await;
}

#[tokio::test]
async fn test_at_hash_mismatch() {
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    provider
        .mount_token("abc123", &id_token_for(&nonce, common::now(), "other"), "tok")
        .await;

    let err = backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Token error: Invalid access token");
}

#[tokio::test]
async fn test_wrong_audience() {
    let provider = MockProvider::start().await;
    provider.mount_jwks(vec![common::rsa_jwk("K1", K1_N)]).await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, nonce) = begin(&backend, &session).await;
    let mut claims = common::claims(&nonce, common::now());
    claims["aud"] = json!("someone-else");
    provider
        .mount_token("abc123", &common::sign(&claims, "K1", K1_PEM), "tok")
        .await;

    let err = backend
        .complete(&callback("abc123", &state), &session)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Token error: Invalid audience");
    assert_eq!(nonces.len(), 1);
}

#[tokio::test]
async fn test_state_mismatch() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    begin(&backend, &session).await;
    let err = backend
        .complete(&callback("abc123", "forged"), &session)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::StateForbidden));

    let err = backend
        .complete(&callback("abc123", "forged"), &MemorySession::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::StateMissing));
}

#[tokio::test]
async fn test_provider_error_on_callback() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, _) = begin(&backend, &session).await;
    let params = CallbackParams::from([
        ("error".to_string(), "access_denied".to_string()),
        ("state".to_string(), state),
    ]);
    let err = backend.complete(&params, &session).await.unwrap_err();
    assert!(matches!(err, AuthError::Canceled { .. }));
}

#[tokio::test]
async fn test_missing_code() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let backend = common::backend(&provider.settings(), Arc::clone(&nonces));
    let session = MemorySession::new();

    let (_, state, _) = begin(&backend, &session).await;
    let params = CallbackParams::from([("state".to_string(), state)]);
    let err = backend.complete(&params, &session).await.unwrap_err();
    assert_eq!(err.to_string(), "Missing needed parameter code");
}

#[tokio::test]
async fn test_optional_params_rejected_before_redirect() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());

    let settings = provider.settings().with_provider("oidc", "PROMPT", "bogus_value");
    let backend = common::backend(&settings, Arc::clone(&nonces));
    let err = backend.auth_url(&MemorySession::new()).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidParameter { ref name } if name == "prompt"));

    let settings = provider.settings().with_provider("oidc", "UI_LOCALES", "en");
    let backend = common::backend(&settings, Arc::clone(&nonces));
    let err = backend.auth_url(&MemorySession::new()).await.unwrap_err();
    assert!(matches!(err, AuthError::NotImplementedParameter { ref name } if name == "ui_locales"));

    assert!(nonces.is_empty());
}

#[tokio::test]
async fn test_optional_params_appended() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let settings = provider
        .settings()
        .with_provider("oidc", "PROMPT", "login consent")
        .with_provider("oidc", "DISPLAY", "popup")
        .with_provider("oidc", "MAX_AGE", 300);
    let backend = common::backend(&settings, nonces);

    let url = backend.auth_url(&MemorySession::new()).await.unwrap();
    assert_eq!(common::query_param(&url, "prompt").as_deref(), Some("login consent"));
    assert_eq!(common::query_param(&url, "display").as_deref(), Some("popup"));
    assert_eq!(common::query_param(&url, "max_age").as_deref(), Some("300"));
}

#[tokio::test]
async fn test_settings_override_discovery() {
    let provider = MockProvider::start().await;
    let nonces = Arc::new(MemoryNonceStore::new());
    let settings = provider
        .settings()
        .with_provider("oidc", "AUTHORIZATION_URL", "https://login.example/auth")
        .with_global("ID_TOKEN_ISSUER", "https://issuer.example");
    let backend = common::backend(&settings, nonces);

    assert_eq!(
        backend.authorization_url().await.unwrap(),
        "https://login.example/auth"
    );
    assert_eq!(
        backend.id_token_issuer().await.unwrap(),
        "https://issuer.example"
    );
    assert_eq!(
        backend.access_token_url().await.unwrap(),
        format!("{}/token", provider.uri())
    );
}

#[tokio::test]
async fn test_missing_endpoint_without_discovery() {
    let nonces = Arc::new(MemoryNonceStore::new());
    let settings = Settings::new()
        .with_provider("oidc", "KEY", common::CLIENT_ID)
        .with_provider("oidc", "SECRET", common::CLIENT_SECRET)
        .with_provider("oidc", "REDIRECT_URI", common::REDIRECT_URI);
    let backend = common::backend(&settings, nonces);

    let err = backend.auth_url(&MemorySession::new()).await.unwrap_err();
    assert!(
        matches!(err, AuthError::MissingConfiguration { ref field } if field == "AUTHORIZATION_URL")
    );
}

#[tokio::test]
async fn test_unreachable_discovery() {
    let nonces = Arc::new(MemoryNonceStore::new());
    let settings = Settings::new()
        .with_provider("oidc", "OIDC_ENDPOINT", "http://127.0.0.1:1")
        .with_provider("oidc", "KEY", common::CLIENT_ID)
        .with_provider("oidc", "SECRET", common::CLIENT_SECRET)
        .with_provider("oidc", "REDIRECT_URI", common::REDIRECT_URI);
    let backend = common::backend(&settings, nonces);

    let err = backend.auth_url(&MemorySession::new()).await.unwrap_err();
    assert!(matches!(err, AuthError::Configuration { .. }), "got {err:?}");
}
