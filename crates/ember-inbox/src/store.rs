use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use ember_types::PeerId;
use ember_types::models::Conversation;

/// Immutable view of every live conversation at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxSnapshot {
    pub(crate) conversations: BTreeMap<PeerId, Conversation>,
    pub(crate) active: Option<PeerId>,
    /// Peers removed by an unmatch during the current cache lifetime.
    pub(crate) tombstones: BTreeSet<PeerId>,
}

impl InboxSnapshot {
    pub fn get(&self, peer: PeerId) -> Option<&Conversation> {
        self.conversations.get(&peer)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// The conversation currently on screen, if any.
    pub fn active(&self) -> Option<PeerId> {
        self.active
    }

    pub fn is_unmatched(&self, peer: PeerId) -> bool {
        self.tombstones.contains(&peer)
    }
}

struct Shared {
    state: watch::Sender<Arc<InboxSnapshot>>,
    lifetime: AtomicU64,
}

/// Shared conversation collection.
///
/// Readers get whole snapshots and never see a half-applied change. Writes
/// go through [`Reconciler`](crate::Reconciler) only.
#[derive(Clone)]
pub struct Inbox {
    shared: Arc<Shared>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: watch::Sender::new(Arc::new(InboxSnapshot::default())),
                lifetime: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<InboxSnapshot> {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<InboxSnapshot>> {
        self.shared.state.subscribe()
    }

    /// Bumped by every `clear`. Work started in an older lifetime must not
    /// be committed.
    pub fn lifetime(&self) -> u64 {
        self.shared.lifetime.load(Ordering::Acquire)
    }

    /// Copy-on-write update: the closure mutates a private copy whenever a
    /// reader still holds the current snapshot. Subscribers are notified only
    /// when the closure reports a change.
    pub(crate) fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut InboxSnapshot) -> bool,
    {
        self.shared
            .state
            .send_if_modified(|snapshot| f(Arc::make_mut(snapshot)))
    }

    pub(crate) fn reset(&self) {
        self.shared.lifetime.fetch_add(1, Ordering::AcqRel);
        self.shared
            .state
            .send_replace(Arc::new(InboxSnapshot::default()));
    }
}
