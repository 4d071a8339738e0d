use std::sync::Arc;

use futures_util::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use ember_types::api::{LoginRequest, RefreshRequest, RefreshResponse, TokenPair};

use crate::api::Api;
use crate::authenticator::SessionAuthenticator;
use crate::error::{ApiError, ApiResult, AuthError, AuthResult};
use crate::exchange::TokenExchange;

const TOKEN_PATH: &str = "token/";
const REFRESH_PATH: &str = "token/refresh/";

/// REST root for an API origin: `<origin>/api/`.
pub fn rest_root(origin: &Url) -> Result<Url, url::ParseError> {
    let mut origin = origin.clone();
    if !origin.path().ends_with('/') {
        let path = format!("{}/", origin.path());
        origin.set_path(&path);
    }
    origin.join("api/")
}

/// Credential exchange endpoints never carry a bearer token and never
/// trigger session invalidation.
fn is_exchange_path(path: &str) -> bool {
    path.starts_with(TOKEN_PATH)
}

/// Unauthenticated client for `token/` and `token/refresh/`.
pub struct RefreshClient {
    client: reqwest::Client,
    base: Url,
}

impl RefreshClient {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    /// Password login. Returns a fresh access/refresh pair.
    pub async fn obtain(&self, username: &str, password: &str) -> AuthResult<TokenPair> {
        let resp = self
            .client
            .post(self.base.join(TOKEN_PATH)?)
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Rejected(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

impl TokenExchange for RefreshClient {
    fn refresh<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, AuthResult<RefreshResponse>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.base.join(REFRESH_PATH)?)
                .json(&RefreshRequest { refresh })
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(AuthError::Rejected(resp.status().as_u16()));
            }
            Ok(resp.json().await?)
        })
    }
}

/// reqwest-backed [`Api`]. Runs the authenticator before every
/// non-exchange request so an access token near expiry is refreshed first.
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
    authenticator: Arc<SessionAuthenticator>,
    invalidated: broadcast::Sender<()>,
}

impl HttpApi {
    pub fn new(
        client: reqwest::Client,
        base: Url,
        authenticator: Arc<SessionAuthenticator>,
    ) -> Self {
        let (invalidated, _) = broadcast::channel(16);
        Self {
            client,
            base,
            authenticator,
            invalidated,
        }
    }

    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.authenticator
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ApiResult<Value> {
        let exchange = is_exchange_path(path);
        let url = self.base.join(path)?;
        let mut req = self.client.request(method.clone(), url);

        if !exchange {
            // A failed refresh still sends the request; the server answers
            // 401 and the invalidation path below takes over.
            self.authenticator.is_session_valid().await;
            let access = self.authenticator.store().load().ok().and_then(|c| c.access);
            if let Some(access) = access {
                req = req.bearer_auth(access);
            }
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        debug!(%method, path, status = status.as_u16(), "API response");

        if !exchange && matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!(path, status = status.as_u16(), "Request rejected, invalidating session");
            let _ = self.invalidated.send(());
            return Err(ApiError::SessionInvalidated);
        }
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Api for HttpApi {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ApiResult<Value>> {
        Box::pin(self.request(Method::GET, path, None))
    }

    fn post<'a>(&'a self, path: &'a str, body: Value) -> BoxFuture<'a, ApiResult<Value>> {
        Box::pin(self.request(Method::POST, path, Some(body)))
    }

    fn patch<'a>(&'a self, path: &'a str, body: Value) -> BoxFuture<'a, ApiResult<Value>> {
        Box::pin(self.request(Method::PATCH, path, Some(body)))
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            self.request(Method::DELETE, path, None).await?;
            Ok(())
        })
    }

    fn subscribe_invalidations(&self) -> broadcast::Receiver<()> {
        self.invalidated.subscribe()
    }
}
