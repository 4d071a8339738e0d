use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ember_auth::CredentialSource;
use ember_types::Topic;

use crate::channel::{ChannelEvents, ChannelHandle, ChannelState, Shared};
use crate::config::GatewayConfig;
use crate::connection::Driver;
use crate::error::GatewayError;

struct Inner {
    config: Arc<GatewayConfig>,
    credentials: Arc<dyn CredentialSource>,
    /// Parent of every channel's cancellation token. Replaced after
    /// `close_all` so later channels are unaffected.
    scope: Mutex<CancellationToken>,
    channels: Mutex<Vec<Weak<Shared>>>,
}

/// Opens channels and can tear all of them down at once (logout).
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                credentials,
                scope: Mutex::new(CancellationToken::new()),
                channels: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Does not block: the connection is made by a background task and
    /// reported through the returned event stream. Must be called inside a
    /// tokio runtime.
    pub fn open_channel(&self, topic: Topic, enabled: bool) -> (ChannelHandle, ChannelEvents) {
        let id = Uuid::new_v4();
        let shared = Arc::new(Shared::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = match self.inner.scope.lock() {
            Ok(scope) => scope.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        };

        match self.inner.channels.lock() {
            Ok(mut channels) => {
                channels.retain(|c| c.strong_count() > 0);
                channels.push(Arc::downgrade(&shared));
            }
            Err(e) => warn!("Channel registry unavailable: {}", e),
        }

        debug!(channel = %id, %topic, enabled, "Opening channel");
        let driver = Driver {
            id,
            topic: topic.clone(),
            enabled,
            config: self.inner.config.clone(),
            credentials: self.inner.credentials.clone(),
            shared: shared.clone(),
            control: control_rx,
            events: event_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());

        (
            ChannelHandle::new(id, topic, enabled, control_tx, shared.clone(), cancel),
            ChannelEvents::new(event_rx, shared),
        )
    }

    /// Closes every channel opened so far and waits until each one reports
    /// `Closed`. Channels opened afterwards are not affected.
    pub async fn close_all(&self) {
        let scope = match self.inner.scope.lock() {
            Ok(mut scope) => std::mem::replace(&mut *scope, CancellationToken::new()),
            Err(poisoned) => {
                std::mem::replace(&mut *poisoned.into_inner(), CancellationToken::new())
            }
        };

        let live: Vec<Arc<Shared>> = match self.inner.channels.lock() {
            Ok(mut channels) => channels.drain(..).filter_map(|c| c.upgrade()).collect(),
            Err(e) => {
                warn!("Channel registry unavailable: {}", e);
                Vec::new()
            }
        };

        for shared in &live {
            shared.request_close();
        }
        scope.cancel();

        let wait = futures_util::future::join_all(live.iter().map(|s| s.wait_closed()));
        let limit = self.inner.config.close_timeout * 2;
        if tokio::time::timeout(limit, wait).await.is_err() {
            warn!("Some channels did not close within {:?}", limit);
        }
        info!(count = live.len(), "All channels closed");
    }

    /// Number of channels that are neither closing nor closed.
    pub fn live_channels(&self) -> usize {
        match self.inner.channels.lock() {
            Ok(channels) => channels
                .iter()
                .filter_map(|c| c.upgrade())
                .filter(|s| !matches!(s.state(), ChannelState::Closing | ChannelState::Closed))
                .count(),
            Err(_) => 0,
        }
    }
}
