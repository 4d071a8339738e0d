//! Credentials and request plumbing for the ember client.
//!
//! - `TokenStore`: where access/refresh credentials and the user snapshot live
//! - `SessionAuthenticator`: expiry check with a safety margin and a
//!   single-flight refresh exchange
//! - `HttpApi`: bearer-authenticated JSON requests that broadcast session
//!   invalidation on 401/403

pub mod api;
pub mod authenticator;
pub mod claims;
pub mod error;
pub mod exchange;
pub mod http;
pub mod store;

pub use api::Api;
pub use authenticator::{CredentialSource, DEFAULT_MARGIN_SECS, SessionAuthenticator};
pub use error::{ApiError, ApiResult, AuthError, AuthResult};
pub use exchange::TokenExchange;
pub use http::{HttpApi, RefreshClient, rest_root};
pub use store::{Credentials, MemoryTokenStore, TokenStore};
