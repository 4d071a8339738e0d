use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use ember_auth::{Api, RefreshClient, SessionAuthenticator, TokenStore};
use ember_gateway::ChannelManager;
use ember_inbox::{Inbox, Reconciler, UnreadWatch};
use ember_types::PeerId;
use ember_types::events::Notification;
use ember_types::models::{Conversation, UserSnapshot};

use crate::cache::{QueryCache, QueryKey};
use crate::error::{SessionError, SessionResult};
use crate::source::CachedConversations;
use crate::state::SessionState;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Identifies a callback registered with [`Session::on_logout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogoutHook(u64);

#[derive(Default)]
struct Cleanup {
    next: u64,
    callbacks: Vec<(LogoutHook, CleanupFn)>,
}

/// Collaborators a session is built from.
pub struct SessionDeps {
    pub store: Arc<dyn TokenStore>,
    pub authenticator: Arc<SessionAuthenticator>,
    pub api: Arc<dyn Api>,
    pub channels: ChannelManager,
    /// Needed for [`Session::login_with_password`] only.
    pub login: Option<Arc<RefreshClient>>,
}

pub(crate) struct Inner {
    pub store: Arc<dyn TokenStore>,
    pub authenticator: Arc<SessionAuthenticator>,
    pub api: Arc<dyn Api>,
    pub channels: ChannelManager,
    pub login: Option<Arc<RefreshClient>>,
    pub reconciler: Reconciler,
    pub cache: Arc<QueryCache>,
    pub state: watch::Sender<SessionState>,
    pub user: watch::Sender<Option<UserSnapshot>>,
    /// Advanced by every teardown. Hydration commits only while the epoch it
    /// started in is still current; the lock makes check-and-write atomic.
    epoch: Mutex<u64>,
    cleanup: Mutex<Cleanup>,
    /// Open conversation views per peer. The active pointer is released when
    /// the last view of a peer goes away.
    views: Mutex<HashMap<PeerId, usize>>,
    events: mpsc::UnboundedSender<Notification>,
}

/// Process-wide authentication state and everything that hangs off it.
///
/// Cheap to clone. Must be created inside a tokio runtime: construction
/// spawns the reconciler queue and a task that tears the session down when
/// any request is rejected with 401/403.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Inner>,
}

impl Session {
    pub fn new(deps: SessionDeps) -> Self {
        let reconciler = Reconciler::new();
        let cache = Arc::new(QueryCache::new());
        let (events, queue) = mpsc::unbounded_channel();

        let source = Arc::new(CachedConversations::new(deps.api.clone(), cache.clone()));
        tokio::spawn(reconciler.clone().run(queue, source));

        let mut invalidations = deps.api.subscribe_invalidations();
        let inner = Arc::new(Inner {
            store: deps.store,
            authenticator: deps.authenticator,
            api: deps.api,
            channels: deps.channels,
            login: deps.login,
            reconciler,
            cache,
            state: watch::Sender::new(SessionState::Initializing),
            user: watch::Sender::new(None),
            epoch: Mutex::new(0),
            cleanup: Mutex::new(Cleanup::default()),
            views: Mutex::new(HashMap::new()),
            events,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                match invalidations.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                let Some(inner) = weak.upgrade() else { break };
                Session { inner }.force_teardown().await;
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn user(&self) -> Option<UserSnapshot> {
        self.inner.user.borrow().clone()
    }

    pub fn watch_user(&self) -> watch::Receiver<Option<UserSnapshot>> {
        self.inner.user.subscribe()
    }

    pub fn inbox(&self) -> Inbox {
        self.inner.reconciler.inbox()
    }

    pub fn unread_count(&self) -> u64 {
        self.inbox().unread_count()
    }

    pub fn watch_unread(&self) -> UnreadWatch {
        self.inbox().watch_unread()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    pub fn api(&self) -> &Arc<dyn Api> {
        &self.inner.api
    }

    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.inner.authenticator
    }

    /// Queue a push event for the reconciler. Events are applied in the
    /// order they are queued.
    pub fn enqueue(&self, event: Notification) {
        if self.inner.events.send(event).is_err() {
            warn!("Reconciler queue is closed, dropping event");
        }
    }

    /// Marks the conversation on screen. Prefer
    /// [`open_conversation`](Self::open_conversation), which also clears it.
    pub fn set_active_conversation(&self, peer: Option<PeerId>) {
        self.inner.reconciler.set_active_conversation(peer);
    }

    /// Registers a callback that runs at the start of the next [`logout`].
    /// Callbacks are dropped without running when the session is torn down
    /// because the server rejected it.
    ///
    /// [`logout`]: Self::logout
    pub fn on_logout<F, Fut>(&self, callback: F) -> LogoutHook
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: CleanupFn =
            Box::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) });
        let mut cleanup = self.inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        let hook = LogoutHook(cleanup.next);
        cleanup.next += 1;
        cleanup.callbacks.push((hook, callback));
        hook
    }

    /// Unregisters a logout callback that has not run yet. Returns whether
    /// it was still pending.
    pub fn remove_logout_hook(&self, hook: LogoutHook) -> bool {
        let mut cleanup = self.inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        let before = cleanup.callbacks.len();
        cleanup.callbacks.retain(|(h, _)| *h != hook);
        cleanup.callbacks.len() != before
    }

    /// Number of callbacks waiting for the next logout.
    pub fn logout_hooks(&self) -> usize {
        self.inner
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    fn take_cleanup(&self) -> Vec<CleanupFn> {
        let mut cleanup = self.inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut cleanup.callbacks)
            .into_iter()
            .map(|(_, callback)| callback)
            .collect()
    }

    pub(crate) fn enter_view(&self, peer: PeerId) {
        *self
            .inner
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer)
            .or_default() += 1;
        self.set_active_conversation(Some(peer));
    }

    pub(crate) fn leave_view(&self, peer: PeerId) {
        let mut views = self.inner.views.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = views.get_mut(&peer) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            views.remove(&peer);
            self.inner.reconciler.leave_conversation(peer);
        }
    }

    fn epoch(&self) -> u64 {
        *self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` only if no teardown happened since `epoch` was read.
    fn commit<F>(&self, epoch: u64, f: F) -> bool
    where
        F: FnOnce(&Inner),
    {
        let current = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            return false;
        }
        f(&self.inner);
        true
    }

    /// Checks the stored credential once and settles the initial state.
    pub async fn init(&self) -> SessionResult<SessionState> {
        let epoch = self.epoch();
        if self.inner.authenticator.is_session_valid().await {
            debug!("Stored session is valid, hydrating");
            self.hydrate(epoch).await
        } else {
            self.commit(epoch, |inner| {
                inner.state.send_replace(SessionState::Unauthenticated);
            });
            info!("No valid stored session");
            Ok(self.state())
        }
    }

    /// Stores a fresh credential pair and hydrates.
    pub async fn login(&self, access: &str, refresh: &str) -> SessionResult<SessionState> {
        let epoch = self.epoch();
        self.inner.store.set_access(access, Some(refresh))?;
        self.hydrate(epoch).await
    }

    pub async fn login_with_password(
        &self,
        username: &str,
        password: &str,
    ) -> SessionResult<SessionState> {
        let client = self
            .inner
            .login
            .as_ref()
            .ok_or(SessionError::PasswordLoginUnavailable)?;
        let pair = client.obtain(username, password).await?;
        info!(username, "Password login accepted");
        self.login(&pair.access, &pair.refresh).await
    }

    async fn hydrate(&self, epoch: u64) -> SessionResult<SessionState> {
        match self.try_hydrate(epoch).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Hydration failed: {}", e);
                self.commit(epoch, |inner| {
                    inner.state.send_if_modified(|state| {
                        if *state == SessionState::Initializing {
                            *state = SessionState::Unauthenticated;
                            true
                        } else {
                            false
                        }
                    });
                });
                Err(e)
            }
        }
    }

    /// Never trusts a stored user snapshot: the canonical one is fetched and
    /// stored before the state turns `Authenticated`.
    async fn try_hydrate(&self, epoch: u64) -> SessionResult<SessionState> {
        let cache = &self.inner.cache;
        let value = cache.fetch(self.inner.api.as_ref(), QueryKey::User).await?;
        let user: UserSnapshot = serde_json::from_value(value)?;

        let stored = self.commit(epoch, |inner| {
            if let Err(e) = inner.store.set_user(&user) {
                warn!("Could not persist user snapshot: {}", e);
            }
            inner.user.send_replace(Some(user.clone()));
        });
        if !stored {
            debug!("Discarding hydration of a closed session");
            return Ok(self.state());
        }

        if user.is_complete() {
            self.prefetch().await;
        } else {
            debug!(
                has_profile = user.has_profile,
                verified = user.is_email_verified,
                tos = user.accepted_tos,
                "Account incomplete, skipping prefetch"
            );
        }

        let authenticated = self.commit(epoch, |inner| {
            inner.state.send_replace(SessionState::Authenticated);
        });
        if authenticated {
            info!(username = %user.username, "Session authenticated");
        }
        Ok(self.state())
    }

    /// Warms swipe, match and profile. The match list also seeds the inbox.
    async fn prefetch(&self) {
        let cache = &self.inner.cache;
        let api = self.inner.api.as_ref();
        let lifetime = self.inner.reconciler.inbox().lifetime();

        let (swipe, matches, profile) = tokio::join!(
            cache.fetch(api, QueryKey::Swipe),
            cache.fetch(api, QueryKey::Match),
            cache.fetch(api, QueryKey::Profile),
        );

        if let Err(e) = swipe {
            warn!("Could not prefetch swipe candidates: {}", e);
        }
        if let Err(e) = profile {
            warn!("Could not prefetch profile: {}", e);
        }
        let conversations = matches
            .map_err(SessionError::from)
            .and_then(|v| Ok(serde_json::from_value::<Vec<Conversation>>(v)?));
        match conversations {
            Ok(list) => {
                let count = list.len();
                if self.inner.reconciler.replace_all_if(lifetime, list) {
                    debug!(count, "Inbox seeded");
                }
            }
            Err(e) => warn!("Could not prefetch matches: {}", e),
        }
    }

    /// Runs the registered cleanup callbacks, then clears credentials, user,
    /// caches and the inbox and closes every channel.
    pub async fn logout(&self) {
        let callbacks = self.take_cleanup();
        debug!(count = callbacks.len(), "Running logout callbacks");
        for callback in callbacks {
            callback().await;
        }
        self.teardown("logout").await;
    }

    /// Teardown after the server rejected the session. Cleanup callbacks are
    /// discarded: they would only hit the same rejection.
    async fn force_teardown(&self) {
        if self.state() == SessionState::Unauthenticated
            && self.inner.store.load().map(|c| c.is_empty()).unwrap_or(false)
        {
            return;
        }
        let dropped = self.take_cleanup().len();
        warn!(dropped_callbacks = dropped, "Session rejected by server, tearing down");
        self.teardown("session invalidated").await;
    }

    async fn teardown(&self, reason: &str) {
        {
            let mut epoch = self.inner.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            *epoch += 1;
            // Flip state first so feeds stop asking for channels
            self.inner.user.send_replace(None);
            self.inner.state.send_replace(SessionState::Unauthenticated);
            self.inner.authenticator.invalidate();
        }

        self.inner.channels.close_all().await;
        self.inner.reconciler.clear();
        self.inner.cache.clear();
        if let Err(e) = self.inner.store.clear() {
            warn!("Could not clear credential store: {}", e);
        }
        info!(reason, "Session closed");
    }

    /// `DELETE match/{peer}/`, then drops the conversation locally.
    pub async fn unmatch(&self, peer: PeerId) -> SessionResult<()> {
        self.inner.api.delete(&format!("match/{}/", peer)).await?;
        self.inner
            .reconciler
            .apply(&Notification::Unmatch { id: peer });
        self.inner.cache.update(QueryKey::Match, |v| {
            if let Some(items) = v.as_array_mut() {
                items.retain(|c| c["profile"]["user"] != peer.0);
            }
        });
        self.inner.cache.invalidate(QueryKey::Messages(peer));
        info!(%peer, "Unmatched");
        Ok(())
    }

    pub async fn report(&self, peer: PeerId, reason: &str) -> SessionResult<()> {
        self.inner
            .api
            .post(&format!("report/{}/", peer), json!({ "reason": reason }))
            .await?;
        info!(%peer, "Conversation reported");
        Ok(())
    }
}
