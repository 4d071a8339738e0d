use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ember_types::PeerId;
use ember_types::events::Notification;
use ember_types::models::Conversation;

use crate::store::{Inbox, InboxSnapshot};

/// Where the reconciler gets conversation data that push events don't carry.
pub trait ConversationSource: Send + Sync {
    /// The full match list.
    fn fetch_all(&self) -> BoxFuture<'_, anyhow::Result<Vec<Conversation>>>;

    /// One match, or `None` when the server no longer has it.
    fn fetch_one(&self, peer: PeerId) -> BoxFuture<'_, anyhow::Result<Option<Conversation>>>;
}

/// Work an applied event leaves for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    None,
    /// A new match: profiles are not in the payload, reload the list.
    RefetchAll,
    /// A message for a peer we have no record of yet.
    RefetchPeer(PeerId),
}

/// The single writer of the conversation collection.
#[derive(Clone)]
pub struct Reconciler {
    inbox: Inbox,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            inbox: Inbox::new(),
        }
    }

    /// Read-only handle on the collection this reconciler writes.
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn apply(&self, event: &Notification) -> Followup {
        let mut followup = Followup::None;
        match *event {
            Notification::Unmatch { id } => {
                self.inbox.update(|s| {
                    let removed = s.conversations.remove(&id).is_some();
                    let buried = s.tombstones.insert(id);
                    removed || buried
                });
                debug!(peer = %id, "Unmatched");
            }
            Notification::Message { id, .. } => {
                self.inbox.update(|s| {
                    if s.tombstones.contains(&id) {
                        return false;
                    }
                    let active = s.active == Some(id);
                    match s.conversations.get_mut(&id) {
                        Some(_) if active => false,
                        Some(conversation) => {
                            conversation.unread_count = conversation.unread_count.saturating_add(1);
                            true
                        }
                        None => {
                            followup = Followup::RefetchPeer(id);
                            false
                        }
                    }
                });
            }
            Notification::Match { id } => {
                debug!(peer = %id, "New match, reloading conversations");
                followup = Followup::RefetchAll;
            }
        }
        followup
    }

    /// Marks `peer` as the conversation on screen and zeroes its unread count.
    /// `None` clears the pointer.
    pub fn set_active_conversation(&self, peer: Option<PeerId>) {
        self.inbox.update(|s| {
            let mut changed = s.active != peer;
            s.active = peer;
            if let Some(conversation) = peer.and_then(|p| s.conversations.get_mut(&p)) {
                changed |= conversation.unread_count != 0;
                conversation.unread_count = 0;
            }
            changed
        });
    }

    /// Clears the pointer only if it still names `peer`.
    pub fn leave_conversation(&self, peer: PeerId) {
        self.inbox.update(|s| {
            if s.active == Some(peer) {
                s.active = None;
                true
            } else {
                false
            }
        });
    }

    /// Replaces the collection with a server listing.
    pub fn replace_all(&self, conversations: Vec<Conversation>) {
        self.inbox.update(|s| {
            install(s, conversations);
            true
        });
    }

    /// Like [`replace_all`](Self::replace_all), but dropped when the inbox
    /// was cleared since `lifetime` was read.
    pub fn replace_all_if(&self, lifetime: u64, conversations: Vec<Conversation>) -> bool {
        let inbox = &self.inbox;
        let mut committed = false;
        inbox.update(|s| {
            if inbox.lifetime() != lifetime {
                return false;
            }
            install(s, conversations);
            committed = true;
            true
        });
        committed
    }

    /// Inserts or replaces one record, unless the peer was unmatched or the
    /// inbox was cleared since `lifetime` was read.
    pub fn upsert_if(&self, lifetime: u64, mut conversation: Conversation) -> bool {
        let inbox = &self.inbox;
        let peer = conversation.peer_id();
        let mut committed = false;
        inbox.update(|s| {
            if inbox.lifetime() != lifetime || s.tombstones.contains(&peer) {
                return false;
            }
            if s.active == Some(peer) {
                conversation.unread_count = 0;
            }
            s.conversations.insert(peer, conversation);
            committed = true;
            true
        });
        committed
    }

    /// Empties the collection and ends the current cache lifetime.
    pub fn clear(&self) {
        self.inbox.reset();
    }

    /// Applies queued events in arrival order, performing each followup
    /// before the next event is taken. Returns when the queue closes.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<Notification>,
        source: Arc<dyn ConversationSource>,
    ) {
        while let Some(event) = events.recv().await {
            match self.apply(&event) {
                Followup::None => {}
                Followup::RefetchAll => {
                    let lifetime = self.inbox.lifetime();
                    match source.fetch_all().await {
                        Ok(list) => {
                            let count = list.len();
                            if self.replace_all_if(lifetime, list) {
                                info!(count, "Conversations reloaded");
                            } else {
                                debug!("Discarding conversation list from a cleared session");
                            }
                        }
                        Err(e) => warn!("Could not reload conversations: {}", e),
                    }
                }
                Followup::RefetchPeer(peer) => {
                    let lifetime = self.inbox.lifetime();
                    match source.fetch_one(peer).await {
                        Ok(Some(conversation)) => {
                            if !self.upsert_if(lifetime, conversation) {
                                debug!(%peer, "Discarding fetched conversation");
                            }
                        }
                        Ok(None) => debug!(%peer, "Message from a peer without a match"),
                        Err(e) => warn!(%peer, "Could not fetch conversation: {}", e),
                    }
                }
            }
        }
        debug!("Reconciler queue closed");
    }
}

fn install(s: &mut InboxSnapshot, conversations: Vec<Conversation>) {
    s.conversations = conversations
        .into_iter()
        .filter(|c| !s.tombstones.contains(&c.peer_id()))
        .map(|c| (c.peer_id(), c))
        .collect();
    if let Some(conversation) = s.active.and_then(|p| s.conversations.get_mut(&p)) {
        conversation.unread_count = 0;
    }
}
