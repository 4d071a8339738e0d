use std::sync::Arc;

use tokio::sync::watch;

use crate::store::{Inbox, InboxSnapshot};

/// Total unread messages across all live conversations.
pub fn unread_count(snapshot: &InboxSnapshot) -> u64 {
    snapshot
        .conversations()
        .map(|c| u64::from(c.unread_count))
        .sum()
}

impl Inbox {
    pub fn unread_count(&self) -> u64 {
        unread_count(&self.snapshot())
    }

    pub fn watch_unread(&self) -> UnreadWatch {
        let rx = self.subscribe();
        let seen = unread_count(&rx.borrow());
        UnreadWatch { rx, seen }
    }
}

/// Follows the unread total. Every read is derived from the latest
/// snapshot; `seen` only remembers what was last reported.
pub struct UnreadWatch {
    rx: watch::Receiver<Arc<InboxSnapshot>>,
    seen: u64,
}

impl UnreadWatch {
    pub fn current(&self) -> u64 {
        unread_count(&self.rx.borrow())
    }

    /// Waits for the next change of the total. Returns `None` once the inbox
    /// is gone.
    pub async fn changed(&mut self) -> Option<u64> {
        loop {
            self.rx.changed().await.ok()?;
            let now = unread_count(&self.rx.borrow_and_update());
            if now != self.seen {
                self.seen = now;
                return Some(now);
            }
        }
    }
}
