//! Conversation-record store, the reconciler that applies push events to it,
//! and the unread-count aggregate derived from it.

pub mod aggregate;
pub mod reconciler;
pub mod store;

pub use aggregate::{UnreadWatch, unread_count};
pub use reconciler::{ConversationSource, Followup, Reconciler};
pub use store::{Inbox, InboxSnapshot};
