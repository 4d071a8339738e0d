use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::claims::access_expiry;
use crate::exchange::TokenExchange;
use crate::store::TokenStore;

/// Seconds before expiry at which an access credential is treated as stale.
pub const DEFAULT_MARGIN_SECS: i64 = 10;

/// Anything that can hand out a currently-valid access credential.
pub trait CredentialSource: Send + Sync {
    /// Returns the access token after making sure the session is valid,
    /// refreshing it first when it is close to expiry.
    fn access_token(&self) -> BoxFuture<'_, Option<String>>;
}

/// Outcome of the most recent exchange, shared with callers that queued
/// behind it.
struct Flight {
    completed: u64,
    last_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Fresh,
    Stale,
    /// Missing, malformed or unreadable. Never refreshed.
    Unusable,
}

/// Decides whether the cached access credential is usable and refreshes it
/// when it is not.
///
/// Concurrent callers that find the credential stale share one exchange:
/// whoever takes the flight lock first performs it, the rest return its
/// outcome without issuing their own.
///
/// [`invalidate`](Self::invalidate) fences off exchanges already in flight,
/// so a refresh that completes after a logout never writes into the store.
pub struct SessionAuthenticator {
    store: Arc<dyn TokenStore>,
    exchange: Arc<dyn TokenExchange>,
    margin_secs: i64,
    flight: Mutex<Flight>,
    completed: AtomicU64,
    generation: std::sync::Mutex<u64>,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<dyn TokenStore>, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            store,
            exchange,
            margin_secs: DEFAULT_MARGIN_SECS,
            flight: Mutex::new(Flight {
                completed: 0,
                last_ok: false,
            }),
            completed: AtomicU64::new(0),
            generation: std::sync::Mutex::new(0),
        }
    }

    pub fn with_margin(mut self, margin_secs: i64) -> Self {
        self.margin_secs = margin_secs;
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Discards the result of any exchange that is still running. Call
    /// before clearing the store on logout.
    pub fn invalidate(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        debug!(generation = *generation, "Pending token refreshes invalidated");
    }

    pub async fn is_session_valid(&self) -> bool {
        self.is_session_valid_at(chrono::Utc::now().timestamp()).await
    }

    /// Same as [`is_session_valid`](Self::is_session_valid) with an explicit
    /// clock reading in unix seconds.
    pub async fn is_session_valid_at(&self, now: i64) -> bool {
        let seen = self.completed.load(Ordering::Acquire);

        match self.access(now) {
            Access::Fresh => return true,
            Access::Unusable => return false,
            Access::Stale => {}
        }

        let mut flight = self.flight.lock().await;
        if flight.completed != seen {
            // An exchange finished while we were waiting for the lock
            return flight.last_ok;
        }

        let ok = self.exchange_once().await;
        flight.completed += 1;
        flight.last_ok = ok;
        self.completed.store(flight.completed, Ordering::Release);
        ok
    }

    fn access(&self, now: i64) -> Access {
        let credentials = match self.store.load() {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not read token store: {}", e);
                return Access::Unusable;
            }
        };
        let Some(access) = credentials.access else {
            return Access::Unusable;
        };
        match access_expiry(&access) {
            Some(exp) if exp > now + self.margin_secs => Access::Fresh,
            Some(_) => Access::Stale,
            None => {
                debug!("Stored access token is malformed");
                Access::Unusable
            }
        }
    }

    async fn exchange_once(&self) -> bool {
        let started = *self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let refresh = match self.store.load() {
            Ok(c) => c.refresh,
            Err(e) => {
                warn!("Could not read token store: {}", e);
                return false;
            }
        };
        let Some(refresh) = refresh else {
            debug!("No refresh token, session is invalid");
            return false;
        };

        let response = match self.exchange.refresh(&refresh).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return false;
            }
        };

        // Held across the write so invalidate() cannot slip in between
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *generation != started {
            info!("Session was invalidated during refresh, dropping new token");
            return false;
        }
        if let Err(e) = self
            .store
            .set_access(&response.access, response.refresh.as_deref())
        {
            warn!("Refreshed access token could not be stored: {}", e);
            return false;
        }
        info!(rotated = response.refresh.is_some(), "Access token refreshed");
        true
    }
}

impl CredentialSource for SessionAuthenticator {
    fn access_token(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            if !self.is_session_valid().await {
                return None;
            }
            self.store.load().ok().and_then(|c| c.access)
        })
    }
}
