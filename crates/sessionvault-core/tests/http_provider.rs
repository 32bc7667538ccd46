use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{bearer_token, body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sessionvault_core::api::{HttpIdentityProvider, IdentityProvider, ProviderError};
use sessionvault_core::auth::{EncryptionSecret, Session};
use sessionvault_core::manager::{ManagerOptions, SessionManager, SessionPhase};
use sessionvault_core::store::{CredentialStore, StorageAdapter, SESSION_KEY, STORE_FILE};
use sessionvault_core::AuthError;

const API_KEY: &str = "public-anon-key";

fn provider(server: &MockServer) -> HttpIdentityProvider {
    HttpIdentityProvider::new(server.uri(), API_KEY).unwrap()
}

fn token_body(access_token: &str, refresh_token: &str) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "expires_at": Utc::now().timestamp() + 3600,
        "refresh_token": refresh_token,
        "user": {
            "id": "user-1",
            "aud": "authenticated",
            "email": "a@x.com",
            "user_metadata": {}
        }
    })
}

#[tokio::test]
async fn test_sign_in_password_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .and(header("apikey", API_KEY))
        .and(body_json(json!({ "email": "a@x.com", "password": "pw" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", "rt-1")))
        .expect(1)
        .mount(&server)
        .await;

    let session = provider(&server).sign_in("a@x.com", "pw").await.unwrap();
    assert_eq!(session.user_id(), "user-1");
    assert_eq!(session.email(), "a@x.com");
    assert_eq!(session.access_token(), "at-1");
    assert_eq!(session.refresh_token(), "rt-1");
    assert!(!session.is_expired());
}

fn expired_token_body() -> serde_json::Value {
    let mut body = token_body("at-stale", "rt-stale");
    body["expires_at"] = json!(Utc::now().timestamp() - 3600);
    body
}

#[tokio::test]
async fn test_sign_in_rejects_already_expired_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expired_token_body()))
        .mount(&server)
        .await;

    let err = provider(&server).sign_in("a@x.com", "pw").await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_refresh_rejects_already_expired_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expired_token_body()))
        .mount(&server)
        .await;

    let err = provider(&server).refresh_session("rt-1").await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_expired_sign_in_leaves_manager_signed_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(expired_token_body()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        CredentialStore::open(
            dir.path().join(STORE_FILE),
            &EncryptionSecret::new("secret"),
            "v1",
        )
        .unwrap(),
    );
    let client = provider(&server).with_storage(Arc::new(StorageAdapter::new(store.clone())));
    let handle = SessionManager::spawn(Arc::new(client), store.clone(), ManagerOptions::default());

    let err = handle.sign_in("a@x.com", "pw").await.unwrap_err();
    assert!(matches!(err, AuthError::NetworkFailure(_)));
    assert_eq!(handle.phase(), SessionPhase::SignedOut);
    assert!(!store.contains(SESSION_KEY));
}

#[tokio::test]
async fn test_sign_in_invalid_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid login credentials"
        })))
        .mount(&server)
        .await;

    let err = provider(&server).sign_in("a@x.com", "bad").await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidCredentials));
}

#[tokio::test]
async fn test_refresh_rejected_is_revocation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .and(body_json(json!({ "refresh_token": "rt-used" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid Refresh Token: Already Used"
        })))
        .mount(&server)
        .await;

    let err = provider(&server).refresh_session("rt-used").await.unwrap_err();
    assert!(matches!(err, ProviderError::RefreshRevoked));
    assert!(err.is_revocation());
}

#[tokio::test]
async fn test_refresh_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let err = provider(&server).refresh_session("rt-1").await.unwrap_err();
    assert!(err.is_transient());
    assert!(!err.is_revocation());
}

#[tokio::test]
async fn test_sign_up_without_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "user-2",
            "email": "new@x.com",
            "confirmation_sent_at": "2026-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let session = provider(&server).sign_up("new@x.com", "pw").await.unwrap();
    assert!(session.is_none());
}

#[tokio::test]
async fn test_get_user_and_update_password_send_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .and(bearer_token("at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "user-1",
            "email": "renamed@x.com"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/auth/v1/user"))
        .and(bearer_token("at-1"))
        .and(body_json(json!({ "password": "new-pw" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "user-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = provider(&server);
    let user = client.get_user("at-1").await.unwrap();
    assert_eq!(user.email.as_deref(), Some("renamed@x.com"));

    let user = client.update_password("at-1", "new-pw").await.unwrap();
    assert_eq!(user.id, "user-1");
    assert!(user.email.is_none());
}

#[tokio::test]
async fn test_expired_access_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "msg": "JWT expired" })))
        .mount(&server)
        .await;

    let err = provider(&server).get_user("at-old").await.unwrap_err();
    assert!(matches!(err, ProviderError::Unauthorized));
}

#[tokio::test]
async fn test_sign_out_and_recover() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/logout"))
        .and(bearer_token("at-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/recover"))
        .and(body_json(json!({ "email": "a@x.com" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = provider(&server);
    client.sign_out("at-1").await.unwrap();
    client.reset_password("a@x.com").await.unwrap();
}

#[tokio::test]
async fn test_get_session_reads_through_storage() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        CredentialStore::open(
            dir.path().join(STORE_FILE),
            &EncryptionSecret::new("secret"),
            "v1",
        )
        .unwrap(),
    );

    let client = provider(&server).with_storage(Arc::new(StorageAdapter::new(store.clone())));
    assert!(client.get_session().await.unwrap().is_none());

    let session = Session::new("user-1", "a@x.com", "at-1", "rt-1", Utc::now().timestamp() + 3600).unwrap();
    store.set(SESSION_KEY, session.to_payload().as_bytes()).unwrap();
    assert_eq!(client.get_session().await.unwrap(), Some(session));

    store.set(SESSION_KEY, b"{\"access_token\":\"at\"}").unwrap();
    assert!(client.get_session().await.unwrap().is_none());

    // No request ever left the process
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("at-1", "rt-1"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client =
        HttpIdentityProvider::with_timeout(server.uri(), API_KEY, Duration::from_millis(200)).unwrap();
    let err = client.sign_in("a@x.com", "pw").await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout));
    assert!(err.is_transient());
}
