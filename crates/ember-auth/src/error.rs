use thiserror::Error;

/// Failures of the credential exchange itself.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("credential exchange rejected with status {0}")]
    Rejected(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API url: {0}")]
    Url(#[from] url::ParseError),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Failures of ordinary authenticated requests.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401/403 from a non-exchange endpoint. The session must be torn down.
    #[error("session is no longer valid")]
    SessionInvalidated,

    #[error("request failed with status {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request path: {0}")]
    Url(#[from] url::ParseError),
}

pub type ApiResult<T> = Result<T, ApiError>;
