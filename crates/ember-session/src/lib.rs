//! Session context: the authentication state machine that owns the query
//! cache, the conversation inbox and every realtime channel, and tears all
//! of them down on logout.

pub mod cache;
pub mod connect;
pub mod context;
pub mod error;
pub mod feeds;
pub mod source;
pub mod state;

pub use cache::{QueryCache, QueryKey};
pub use context::{LogoutHook, Session, SessionDeps};
pub use error::{SessionError, SessionResult};
pub use feeds::{ConversationView, NotificationFeed, SwipeFeed};
pub use source::CachedConversations;
pub use state::SessionState;
