use std::sync::Arc;

use futures_util::future::BoxFuture;

use ember_auth::{Api, ApiError};
use ember_inbox::ConversationSource;
use ember_types::PeerId;
use ember_types::models::Conversation;

use crate::cache::{QueryCache, QueryKey};

/// Loads conversations over the API, keeping the `match/` cache entry in
/// step with what the inbox receives.
pub struct CachedConversations {
    api: Arc<dyn Api>,
    cache: Arc<QueryCache>,
}

impl CachedConversations {
    pub fn new(api: Arc<dyn Api>, cache: Arc<QueryCache>) -> Self {
        Self { api, cache }
    }
}

impl ConversationSource for CachedConversations {
    fn fetch_all(&self) -> BoxFuture<'_, anyhow::Result<Vec<Conversation>>> {
        Box::pin(async move {
            let value = self.cache.fetch(self.api.as_ref(), QueryKey::Match).await?;
            Ok(serde_json::from_value(value)?)
        })
    }

    fn fetch_one(&self, peer: PeerId) -> BoxFuture<'_, anyhow::Result<Option<Conversation>>> {
        Box::pin(async move {
            match self.api.get(&format!("match/{}/", peer)).await {
                Ok(value) => Ok(Some(serde_json::from_value(value)?)),
                Err(ApiError::Status(404)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}
