//! Realtime channel manager.
//!
//! One WebSocket connection per logical topic, bound to the session's access
//! credential through the `Bearer.<token>` subprotocol. Each channel is driven
//! by its own task and reports `Open`, `Frame` and `Closed` events to a single
//! consumer. There is no automatic reconnect: after an abnormal close the
//! owner re-enables the channel to start a fresh cycle.

pub mod channel;
pub mod config;
mod connection;
pub mod error;
pub mod manager;

pub use channel::{
    ChannelEvent, ChannelEvents, ChannelHandle, ChannelSender, ChannelState, CloseInfo,
    ABNORMAL_CLOSURE, NORMAL_CLOSURE, UNAUTHORIZED_CLOSURE,
};
pub use config::{GatewayConfig, bearer_subprotocol};
pub use error::{ChannelError, GatewayError};
pub use manager::ChannelManager;
