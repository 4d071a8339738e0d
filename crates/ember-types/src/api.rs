use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// The only claim the client reads from an access token. The token is
/// otherwise opaque; its signature is checked by the server, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryClaim {
    pub exp: i64,
}

// -- Token exchange --

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Response of `POST token/`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Response of `POST token/refresh/`. `refresh` is present when the server
/// rotates refresh tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}
