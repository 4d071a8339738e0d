//! Channel owners built on a session: the global notification feed, the swipe
//! feed and the per-peer conversation view.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ember_auth::{Api, ApiResult};
use ember_gateway::{ChannelError, ChannelEvent, ChannelEvents, ChannelHandle, ChannelState};
use ember_types::events::{ChatMessage, InboundFrame, OutboundFrame, SwipeDirection};
use ember_types::models::UserSnapshot;
use ember_types::{PeerId, Topic};

use crate::cache::QueryKey;
use crate::context::{LogoutHook, Session};
use crate::error::SessionResult;
use crate::state::SessionState;

type Wanted = fn(SessionState, Option<&UserSnapshot>) -> bool;

/// Notifications run only for an authenticated account with a profile.
fn wants_notifications(state: SessionState, user: Option<&UserSnapshot>) -> bool {
    state.is_authenticated() && user.is_some_and(|u| u.has_profile)
}

fn wants_authenticated(state: SessionState, _user: Option<&UserSnapshot>) -> bool {
    state.is_authenticated()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn next_event(events: &mut Option<ChannelEvents>) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_state(states: &mut Option<watch::Receiver<ChannelState>>) -> Option<ChannelState> {
    match states {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[derive(Default)]
struct Slot {
    handle: Option<ChannelHandle>,
    /// Set once the owner is gone; the task must not open anything after.
    shut: bool,
}

/// A channel on one topic that runs whenever the session wants it.
///
/// The background task opens the channel when `wanted` becomes true, drops
/// it when it turns false and opens a fresh one after the manager closed
/// everything on logout. A channel that closed abnormally stays closed until
/// the session changes or [`retry`](Follower::retry) is called.
///
/// The handle lives in a slot shared with the owner so that dropping the
/// owner closes the channel synchronously.
struct Follower {
    slot: Arc<Mutex<Slot>>,
    state: watch::Receiver<ChannelState>,
    retry: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Follower {
    fn spawn<E>(session: &Session, topic: Topic, wanted: Wanted, on_event: E) -> Self
    where
        E: FnMut(ChannelEvent) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Slot::default()));
        let (published, state) = watch::channel(ChannelState::Idle);
        let (retry, retry_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(follow(
            session.clone(),
            topic,
            wanted,
            on_event,
            slot.clone(),
            published,
            retry_rx,
        ));
        Self {
            slot,
            state,
            retry,
            task,
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    fn retry(&self) {
        let _ = self.retry.send(());
    }

    fn send(&self, frame: OutboundFrame) -> Result<(), ChannelError> {
        match &lock(&self.slot).handle {
            Some(handle) => handle.send(frame),
            None => Err(ChannelError::NotOpen),
        }
    }

    /// Stops following and hands back the current channel, if any.
    fn shut(&self) -> Option<ChannelHandle> {
        let mut slot = lock(&self.slot);
        slot.shut = true;
        slot.handle.take()
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        // Dropping the handle requests the close before the task is gone
        drop(self.shut());
        self.task.abort();
    }
}

async fn follow<E>(
    session: Session,
    topic: Topic,
    wanted: Wanted,
    mut on_event: E,
    slot: Arc<Mutex<Slot>>,
    published: watch::Sender<ChannelState>,
    mut retry: mpsc::UnboundedReceiver<()>,
) where
    E: FnMut(ChannelEvent) + Send + 'static,
{
    let mut session_state = session.watch_state();
    let mut user = session.watch_user();
    let mut events: Option<ChannelEvents> = None;
    let mut states: Option<watch::Receiver<ChannelState>> = None;
    let mut dirty = true;

    loop {
        if dirty {
            dirty = false;
            let want = wanted(
                *session_state.borrow_and_update(),
                user.borrow_and_update().as_ref(),
            );
            let mut held = lock(&slot);
            if held.shut {
                break;
            }
            if !want {
                events = None;
                states = None;
                if held.handle.take().is_some() {
                    debug!(%topic, "Channel no longer wanted, closing");
                    published.send_replace(ChannelState::Closed);
                }
            } else if let Some(handle) = held.handle.as_mut() {
                if handle.state() == ChannelState::Closed {
                    debug!(%topic, "Reconnecting channel");
                    handle.set_enabled(true);
                }
            } else {
                let (handle, channel_events) = session.channels().open_channel(topic.clone(), true);
                published.send_replace(handle.state());
                states = Some(handle.watch_state());
                events = Some(channel_events);
                held.handle = Some(handle);
            }
        }

        tokio::select! {
            changed = session_state.changed() => {
                if changed.is_err() {
                    break;
                }
                dirty = true;
            }
            changed = user.changed() => {
                if changed.is_err() {
                    break;
                }
                dirty = true;
            }
            Some(()) = retry.recv() => dirty = true,
            state = next_state(&mut states) => match state {
                Some(state) => {
                    published.send_replace(state);
                }
                None => states = None,
            },
            event = next_event(&mut events) => match event {
                Some(event) => on_event(event),
                None => {
                    // Driver stopped under us, e.g. by close_all
                    events = None;
                    states = None;
                    lock(&slot).handle = None;
                    published.send_replace(ChannelState::Closed);
                    dirty = true;
                }
            },
        }
    }
}

/// The `notification/` channel, enabled and disabled as the session changes.
///
/// Events are queued for the reconciler. A channel that closes abnormally
/// stays closed until the session state changes again or [`retry`] is
/// called. Dropping the feed closes the channel immediately.
///
/// [`retry`]: NotificationFeed::retry
pub struct NotificationFeed {
    channel: Follower,
}

impl NotificationFeed {
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    /// Re-derive whether the channel should run and reconnect if so.
    pub fn retry(&self) {
        self.channel.retry();
    }
}

#[derive(Default)]
struct PendingSwipes {
    left: Vec<PeerId>,
    right: Vec<PeerId>,
}

impl PendingSwipes {
    fn push(&mut self, id: PeerId, direction: SwipeDirection) {
        match direction {
            SwipeDirection::Left => self.left.push(id),
            SwipeDirection::Right => self.right.push(id),
        }
    }

    fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }
}

/// Posts buffered decisions as `[[left ids], [right ids]]`. Decisions are
/// put back when the request fails.
async fn flush_pending(api: &dyn Api, pending: &Mutex<PendingSwipes>) -> ApiResult<()> {
    let batch = std::mem::take(&mut *lock(pending));
    if batch.is_empty() {
        return Ok(());
    }
    let count = batch.left.len() + batch.right.len();
    match api.post("swipe/", json!([batch.left, batch.right])).await {
        Ok(_) => {
            debug!(count, "Flushed pending swipes");
            Ok(())
        }
        Err(e) => {
            let mut pending = lock(pending);
            pending.left.extend(batch.left);
            pending.right.extend(batch.right);
            Err(e)
        }
    }
}

/// Decisions waiting for an open channel, plus the logout callback that
/// flushes them. At most one callback is registered at a time.
#[derive(Default)]
struct SwipeBuffer {
    pending: Mutex<PendingSwipes>,
    hook: Mutex<Option<LogoutHook>>,
}

impl SwipeBuffer {
    fn arm(self: &Arc<Self>, session: &Session) {
        let mut hook = lock(&self.hook);
        if hook.is_some() {
            return;
        }
        let weak: Weak<SwipeBuffer> = Arc::downgrade(self);
        let api = session.api().clone();
        *hook = Some(session.on_logout(move || async move {
            let Some(buffer) = weak.upgrade() else { return };
            lock(&buffer.hook).take();
            if let Err(e) = flush_pending(api.as_ref(), &buffer.pending).await {
                warn!("Could not flush swipes before logout: {}", e);
            }
        }));
    }
}

/// The `swipe/` channel. Decisions go out as `{id, direction}` frames while
/// the channel is open and are buffered otherwise; buffered decisions are
/// posted on [`flush`](SwipeFeed::flush), on drop and at logout.
///
/// The channel follows the session, so a feed kept across logout and login
/// reconnects for the new session.
pub struct SwipeFeed {
    session: Session,
    channel: Follower,
    buffer: Arc<SwipeBuffer>,
}

impl SwipeFeed {
    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    pub fn retry(&self) {
        self.channel.retry();
    }

    pub async fn swipe(&self, id: PeerId, direction: SwipeDirection) -> SessionResult<()> {
        let cache = self.session.cache();
        let mut exhausted = false;
        cache.update(QueryKey::Swipe, |v| {
            if let Some(profiles) = v.as_array_mut() {
                profiles.retain(|p| p["user"] != id.0);
                exhausted = profiles.is_empty();
            }
        });

        match self.channel.send(OutboundFrame::Swipe { id, direction }) {
            Ok(()) => {}
            Err(ChannelError::NotOpen) => {
                debug!(%id, "Swipe channel not open, buffering decision");
                lock(&self.buffer.pending).push(id, direction);
                self.buffer.arm(&self.session);
            }
            Err(e) => return Err(e.into()),
        }

        if exhausted {
            self.flush().await?;
            cache.fetch(self.session.api().as_ref(), QueryKey::Swipe).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> SessionResult<()> {
        flush_pending(self.session.api().as_ref(), &self.buffer.pending).await?;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        let pending = lock(&self.buffer.pending);
        pending.left.len() + pending.right.len()
    }
}

impl Drop for SwipeFeed {
    fn drop(&mut self) {
        if let Some(hook) = lock(&self.buffer.hook).take() {
            self.session.remove_logout_hook(hook);
        }
        if lock(&self.buffer.pending).is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Swipe feed dropped outside a runtime, pending decisions lost");
            return;
        };
        let api = self.session.api().clone();
        let buffer = self.buffer.clone();
        runtime.spawn(async move {
            if let Err(e) = flush_pending(api.as_ref(), &buffer.pending).await {
                warn!("Could not flush swipes: {}", e);
            }
        });
    }
}

/// An open conversation: the peer is the active conversation and its
/// `message/{peer}/` channel is live while the session is authenticated.
/// Dropping the view closes the channel; the active pointer is released
/// when the last view of the peer goes away.
pub struct ConversationView {
    session: Session,
    peer: PeerId,
    channel: Follower,
    messages: mpsc::UnboundedReceiver<ChatMessage>,
}

impl ConversationView {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    pub fn retry(&self) {
        self.channel.retry();
    }

    pub fn send(&self, text: impl Into<String>) -> SessionResult<()> {
        self.channel.send(OutboundFrame::Chat { text: text.into() })?;
        Ok(())
    }

    /// Next message received on the channel. Messages are also appended to
    /// the cached history.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.messages.recv().await
    }

    /// Cached history, loaded from `message/{peer}/` on first use.
    pub async fn history(&self) -> SessionResult<Vec<ChatMessage>> {
        let value = self
            .session
            .cache()
            .get_or_fetch(self.session.api().as_ref(), QueryKey::Messages(self.peer))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Closes the channel and waits for the close handshake.
    pub async fn close(self) {
        if let Some(handle) = self.channel.shut() {
            handle.close().await;
        }
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.session.leave_view(self.peer);
        debug!(peer = %self.peer, "Conversation closed");
    }
}

impl Session {
    /// Starts the notification feed. It follows the session state for as
    /// long as the returned feed is alive.
    pub fn open_notifications(&self) -> NotificationFeed {
        let session = self.clone();
        let channel = Follower::spawn(
            self,
            Topic::notifications(),
            wants_notifications,
            move |event| match event {
                ChannelEvent::Frame(InboundFrame::Notification(n)) => session.enqueue(n),
                ChannelEvent::Frame(other) => {
                    debug!("Ignoring unexpected frame on notifications: {:?}", other);
                }
                ChannelEvent::Closed(close) if !close.is_normal() => {
                    warn!(code = close.code, reason = %close.reason, "Notifications lost");
                }
                ChannelEvent::Open | ChannelEvent::Closed(_) => {}
            },
        );
        NotificationFeed { channel }
    }

    /// Opens the swipe channel. Inbound frames are match events.
    pub fn open_swipe_feed(&self) -> SwipeFeed {
        let session = self.clone();
        let channel = Follower::spawn(
            self,
            Topic::swipe(),
            wants_authenticated,
            move |event| match event {
                ChannelEvent::Frame(InboundFrame::Notification(n)) => {
                    info!(peer = %n.peer_id(), "Match from swipe");
                    session.enqueue(n);
                }
                ChannelEvent::Frame(other) => debug!("Ignoring swipe frame: {:?}", other),
                ChannelEvent::Open | ChannelEvent::Closed(_) => {}
            },
        );

        SwipeFeed {
            session: self.clone(),
            channel,
            buffer: Arc::new(SwipeBuffer::default()),
        }
    }

    /// Makes `peer` the active conversation, zeroing its unread count, and
    /// opens its message channel.
    pub fn open_conversation(&self, peer: PeerId) -> ConversationView {
        self.enter_view(peer);

        let (tx, messages) = mpsc::unbounded_channel();
        let session = self.clone();
        let channel = Follower::spawn(
            self,
            Topic::messages(peer),
            wants_authenticated,
            move |event| match event {
                ChannelEvent::Frame(InboundFrame::Chat(message)) => {
                    session.cache().append_message(peer, &message);
                    let _ = tx.send(message);
                }
                ChannelEvent::Frame(other) => debug!(%peer, "Ignoring frame: {:?}", other),
                ChannelEvent::Open | ChannelEvent::Closed(_) => {}
            },
        );

        ConversationView {
            session: self.clone(),
            peer,
            channel,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(has_profile: bool) -> UserSnapshot {
        UserSnapshot {
            username: "ana".into(),
            email: String::new(),
            has_profile,
            is_email_verified: false,
            accepted_tos: false,
        }
    }

    #[test]
    fn notifications_need_auth_and_profile() {
        assert!(wants_notifications(SessionState::Authenticated, Some(&user(true))));
        assert!(!wants_notifications(SessionState::Authenticated, Some(&user(false))));
        assert!(!wants_notifications(SessionState::Authenticated, None));
        assert!(!wants_notifications(SessionState::Unauthenticated, Some(&user(true))));
        assert!(!wants_notifications(SessionState::Initializing, Some(&user(true))));
    }

    #[test]
    fn chat_and_swipes_only_need_auth() {
        assert!(wants_authenticated(SessionState::Authenticated, None));
        assert!(!wants_authenticated(SessionState::Unauthenticated, Some(&user(true))));
    }

    #[test]
    fn pending_swipes_split_by_direction() {
        let mut pending = PendingSwipes::default();
        assert!(pending.is_empty());
        pending.push(PeerId(1), SwipeDirection::Left);
        pending.push(PeerId(2), SwipeDirection::Right);
        pending.push(PeerId(3), SwipeDirection::Right);
        assert_eq!(pending.left, vec![PeerId(1)]);
        assert_eq!(pending.right, vec![PeerId(2), PeerId(3)]);
    }
}
