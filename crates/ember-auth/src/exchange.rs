use futures_util::future::BoxFuture;

use ember_types::api::RefreshResponse;

use crate::error::AuthResult;

/// Exchanges a refresh credential for a new access credential.
///
/// Implementations must not attach a bearer token to the exchange request.
pub trait TokenExchange: Send + Sync {
    fn refresh<'a>(&'a self, refresh: &'a str) -> BoxFuture<'a, AuthResult<RefreshResponse>>;
}
