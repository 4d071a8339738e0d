use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::{debug, warn};

use ember_auth::{Api, ApiResult};
use ember_types::PeerId;
use ember_types::events::ChatMessage;

/// Cached server resources, each named after the REST path it comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    User,
    Swipe,
    Match,
    Profile,
    Messages(PeerId),
}

impl QueryKey {
    pub fn path(&self) -> String {
        match self {
            Self::User => "user/".into(),
            Self::Swipe => "swipe/".into(),
            Self::Match => "match/".into(),
            Self::Profile => "profile/".into(),
            Self::Messages(peer) => format!("message/{}/", peer),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Default)]
struct Entries {
    values: HashMap<QueryKey, Value>,
    /// Bumped by `clear`; responses requested before it are not stored.
    generation: u64,
}

/// Request/response cache shared by hydration, feeds and views.
#[derive(Default)]
pub struct QueryCache {
    entries: RwLock<Entries>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: QueryKey) -> Option<Value> {
        self.read().values.get(&key).cloned()
    }

    pub fn contains(&self, key: QueryKey) -> bool {
        self.read().values.contains_key(&key)
    }

    pub fn invalidate(&self, key: QueryKey) {
        if self.write().values.remove(&key).is_some() {
            debug!(%key, "Query invalidated");
        }
    }

    /// Drop any cached value, request a fresh one and store it. A response
    /// that lands after [`clear`](Self::clear) is returned but not kept.
    pub async fn fetch(&self, api: &dyn Api, key: QueryKey) -> ApiResult<Value> {
        self.invalidate(key);
        let generation = self.read().generation;

        let value = api.get(&key.path()).await?;

        let mut entries = self.write();
        if entries.generation == generation {
            entries.values.insert(key, value.clone());
        } else {
            debug!(%key, "Dropping response fetched before the cache was cleared");
        }
        Ok(value)
    }

    pub async fn get_or_fetch(&self, api: &dyn Api, key: QueryKey) -> ApiResult<Value> {
        match self.get(key) {
            Some(value) => Ok(value),
            None => self.fetch(api, key).await,
        }
    }

    /// In-place edit of a cached value. Returns false when nothing is cached.
    pub fn update<F>(&self, key: QueryKey, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        match self.write().values.get_mut(&key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    /// Appends a chat message to the peer's message list, creating the list
    /// if it was not loaded yet.
    pub fn append_message(&self, peer: PeerId, message: &ChatMessage) {
        let message = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(%peer, "Could not cache chat message: {}", e);
                return;
            }
        };
        let mut entries = self.write();
        let list = entries
            .values
            .entry(QueryKey::Messages(peer))
            .or_insert_with(|| Value::Array(Vec::new()));
        match list {
            Value::Array(items) => items.push(message),
            other => *other = Value::Array(vec![message]),
        }
    }

    pub fn clear(&self) {
        let mut entries = self.write();
        entries.values.clear();
        entries.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat(text: &str) -> ChatMessage {
        ChatMessage {
            sender: PeerId(4),
            text: text.into(),
            created_at: "2026-03-01T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn paths() {
        assert_eq!(QueryKey::User.path(), "user/");
        assert_eq!(QueryKey::Match.path(), "match/");
        assert_eq!(QueryKey::Messages(PeerId(12)).path(), "message/12/");
    }

    #[test]
    fn append_creates_then_extends() {
        let cache = QueryCache::new();
        cache.append_message(PeerId(4), &chat("one"));
        cache.append_message(PeerId(4), &chat("two"));

        let list = cache.get(QueryKey::Messages(PeerId(4))).unwrap();
        assert_eq!(list.as_array().unwrap().len(), 2);
        assert_eq!(list[1]["text"], "two");
    }

    #[test]
    fn update_only_touches_cached_values() {
        let cache = QueryCache::new();
        assert!(!cache.update(QueryKey::Swipe, |_| {}));

        cache.write().values.insert(QueryKey::Swipe, json!([{"user": 1}, {"user": 2}]));
        assert!(cache.update(QueryKey::Swipe, |v| {
            if let Some(items) = v.as_array_mut() {
                items.retain(|p| p["user"] != 1);
            }
        }));
        assert_eq!(cache.get(QueryKey::Swipe).unwrap(), json!([{"user": 2}]));
    }

    #[test]
    fn clear_empties_and_advances_generation() {
        let cache = QueryCache::new();
        cache.append_message(PeerId(1), &chat("x"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.read().generation, 1);
    }
}
