use thiserror::Error;

use ember_types::TopicError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unsupported origin scheme {0:?}, expected http(s) or ws(s)")]
    InvalidOrigin(String),

    #[error(transparent)]
    Topic(#[from] TopicError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,

    #[error("channel driver has stopped")]
    Stopped,
}
