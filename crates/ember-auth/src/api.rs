use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ApiResult;

/// Authenticated JSON request/response collaborator.
///
/// Paths are relative to the REST root (`user/`, `match/42/`). Implementations
/// attach the current bearer token to every request except the credential
/// exchange endpoints, and report 401/403 from any other endpoint as
/// [`ApiError::SessionInvalidated`](crate::ApiError::SessionInvalidated) after
/// broadcasting it to [`subscribe_invalidations`](Api::subscribe_invalidations).
pub trait Api: Send + Sync {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ApiResult<Value>>;

    fn post<'a>(&'a self, path: &'a str, body: Value) -> BoxFuture<'a, ApiResult<Value>>;

    fn patch<'a>(&'a self, path: &'a str, body: Value) -> BoxFuture<'a, ApiResult<Value>>;

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ApiResult<()>>;

    /// Fires once per request rejected with 401/403.
    fn subscribe_invalidations(&self) -> broadcast::Receiver<()>;
}
