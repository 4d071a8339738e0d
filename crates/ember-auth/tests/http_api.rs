//! Integration tests: HttpApi against an in-process axum backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use url::Url;

use ember_auth::{
    Api, ApiError, Credentials, HttpApi, MemoryTokenStore, RefreshClient, SessionAuthenticator,
    TokenStore, rest_root,
};
use ember_types::api::ExpiryClaim;

fn token(exp: i64) -> String {
    encode(
        &Header::default(),
        &ExpiryClaim { exp },
        &EncodingKey::from_secret(b"backend-secret"),
    )
    .unwrap()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

struct Backend {
    fresh_access: String,
    refresh_calls: AtomicUsize,
}

async fn refresh(
    State(backend): State<Arc<Backend>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if body["refresh"] != "good-refresh" {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({ "access": backend.fresh_access })))
}

async fn obtain(Json(body): Json<Value>) -> Result<Json<Value>, StatusCode> {
    if body["username"] == "ana" && body["password"] == "hunter22" {
        Ok(Json(json!({ "access": "a", "refresh": "r" })))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn user(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let expected = format!("Bearer {}", backend.fresh_access);
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(auth) if auth == expected => Ok(Json(json!({ "username": "ana" }))),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn forbidden() -> StatusCode {
    StatusCode::FORBIDDEN
}

async fn missing() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn spawn_backend(backend: Arc<Backend>) -> Url {
    let app = Router::new()
        .route("/api/token/", post(obtain))
        .route("/api/token/refresh/", post(refresh))
        .route("/api/user/", get(user))
        .route("/api/report/1/", post(forbidden))
        .route("/api/nothing/", get(missing))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

async fn client(
    credentials: Credentials,
) -> (Arc<Backend>, Arc<MemoryTokenStore>, HttpApi, RefreshClient) {
    let backend = Arc::new(Backend {
        fresh_access: token(now() + 3600),
        refresh_calls: AtomicUsize::new(0),
    });
    let origin = spawn_backend(backend.clone()).await;
    let base = rest_root(&origin).unwrap();

    let http = reqwest::Client::new();
    let store = Arc::new(MemoryTokenStore::with_credentials(credentials));
    let exchange = Arc::new(RefreshClient::new(http.clone(), base.clone()));
    let auth = Arc::new(SessionAuthenticator::new(store.clone(), exchange));
    let api = HttpApi::new(http.clone(), base.clone(), auth);
    (backend, store, api, RefreshClient::new(http, base))
}

#[tokio::test]
async fn stale_token_is_refreshed_before_request() {
    let (backend, store, api, _) =
        client(Credentials::new(token(now() - 60), "good-refresh")).await;

    let body = api.get("user/").await.unwrap();
    assert_eq!(body["username"], "ana");
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.load().unwrap().access, Some(backend.fresh_access.clone()));
}

#[tokio::test]
async fn unauthorized_broadcasts_invalidation() {
    let (backend, _, api, _) = client(Credentials::new(token(now() - 60), "bad-refresh")).await;
    let mut invalidations = api.subscribe_invalidations();

    let err = api.get("user/").await.unwrap_err();
    assert!(matches!(err, ApiError::SessionInvalidated));
    assert!(invalidations.try_recv().is_ok());
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forbidden_also_invalidates() {
    let (backend, _, api, _) = client(Credentials::default()).await;
    let fresh = backend.fresh_access.clone();
    let mut invalidations = api.subscribe_invalidations();
    api.authenticator().store().set_access(&fresh, None).unwrap();

    let err = api.post("report/1/", json!({"reason": "Harassment"})).await.unwrap_err();
    assert!(matches!(err, ApiError::SessionInvalidated));
    assert!(invalidations.try_recv().is_ok());
}

#[tokio::test]
async fn other_errors_keep_the_session() {
    let (backend, _, api, _) = client(Credentials::default()).await;
    api.authenticator()
        .store()
        .set_access(&backend.fresh_access, None)
        .unwrap();
    let mut invalidations = api.subscribe_invalidations();

    let err = api.get("nothing/").await.unwrap_err();
    assert!(matches!(err, ApiError::Status(404)));
    assert!(invalidations.try_recv().is_err());
}

#[tokio::test]
async fn exchange_rejection_does_not_invalidate() {
    let (_, _, api, _) = client(Credentials::default()).await;
    let mut invalidations = api.subscribe_invalidations();

    let err = api
        .post("token/refresh/", json!({"refresh": "nope"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Status(401)));
    assert!(invalidations.try_recv().is_err());
}

#[tokio::test]
async fn password_login() {
    let (_, _, _, refresh_client) = client(Credentials::default()).await;

    let pair = refresh_client.obtain("ana", "hunter22").await.unwrap();
    assert_eq!(pair.access, "a");
    assert_eq!(pair.refresh, "r");
    assert!(refresh_client.obtain("ana", "wrong").await.is_err());
}
