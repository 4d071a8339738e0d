use thiserror::Error;

use ember_auth::{ApiError, AuthError};
use ember_gateway::{ChannelError, GatewayError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credential store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid API origin: {0}")]
    Url(#[from] url::ParseError),

    #[error("password login is not configured for this session")]
    PasswordLoginUnavailable,
}

pub type SessionResult<T> = Result<T, SessionError>;
