use std::sync::Arc;

use tracing::debug;
use url::Url;

use ember_auth::{HttpApi, RefreshClient, SessionAuthenticator, TokenStore, rest_root};
use ember_gateway::{ChannelManager, GatewayConfig};

use crate::context::{Session, SessionDeps};
use crate::error::SessionResult;

impl Session {
    /// Builds an HTTP-backed session for an API origin: REST under
    /// `<origin>api/`, channels under `<ws-origin>ws/`.
    pub fn connect(origin: &Url, store: Arc<dyn TokenStore>) -> SessionResult<Self> {
        Self::connect_with(GatewayConfig::new(origin.clone()), store)
    }

    pub fn connect_with(gateway: GatewayConfig, store: Arc<dyn TokenStore>) -> SessionResult<Self> {
        let client = reqwest::Client::new();
        let base = rest_root(&gateway.origin)?;
        debug!(rest = %base, "Connecting session");

        let login = Arc::new(RefreshClient::new(client.clone(), base.clone()));
        let authenticator = Arc::new(SessionAuthenticator::new(store.clone(), login.clone()));
        let api = Arc::new(HttpApi::new(client, base, authenticator.clone()));
        let channels = ChannelManager::new(gateway, authenticator.clone())?;

        Ok(Self::new(SessionDeps {
            store,
            authenticator,
            api,
            channels,
            login: Some(login),
        }))
    }
}
