//! Result cache contract and an in-memory implementation.
//!
//! The scheduler asks the cache before running a plugin. A hit supplies
//! the fields the plugin would have produced; they are merged through the
//! conflict ledger under the plugin's identity and the action is skipped.
//! After a plugin succeeds its patch is offered to `set`, best-effort.

use crate::errors::CacheError;
use crate::observer::{Emitter, Observable};
use crate::record::{Patch, RecordView};
use crate::registry::Snapshot;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Cached fields for the plugin
    Hit(Patch),
    Miss,
}

/// Skip-execution cache consulted for every admitted plugin.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, identity: &str, record: &Snapshot) -> Result<CacheLookup, CacheError>;

    /// Store what `identity` produced. Failures never affect the run.
    async fn set(&self, identity: &str, record: &Snapshot, produced: &Patch) -> Result<(), CacheError>;

    fn observable(&self) -> Option<&dyn Observable> {
        None
    }
}

pub type KeyFn = Arc<dyn Fn(&str, RecordView<'_>) -> String + Send + Sync>;

/// Process-local cache keyed by plugin identity, optionally refined by record contents.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Patch>>,
    key_fn: Option<KeyFn>,
    hits: AtomicU64,
    misses: AtomicU64,
    emitter: Emitter,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            key_fn: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            emitter: Emitter::new(),
        }
    }

    /// Derive entry keys from the identity and the record, e.g. to cache per email.
    pub fn with_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&str, RecordView<'_>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Pre-populate an entry under the plain identity key.
    pub async fn insert(&self, identity: impl Into<String>, patch: Patch) {
        self.entries.write().await.insert(identity.into(), patch);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn key(&self, identity: &str, record: &Snapshot) -> String {
        match &self.key_fn {
            Some(key_fn) => key_fn(identity, record.view()),
            None => identity.to_string(),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, identity: &str, record: &Snapshot) -> Result<CacheLookup, CacheError> {
        let key = self.key(identity, record);
        let entry = self.entries.read().await.get(&key).cloned();
        match entry {
            Some(patch) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.emitter.emit("hit", json!({ "plugin": identity, "key": key }));
                Ok(CacheLookup::Hit(patch))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.emitter.emit("miss", json!({ "plugin": identity, "key": key }));
                Ok(CacheLookup::Miss)
            }
        }
    }

    async fn set(&self, identity: &str, record: &Snapshot, produced: &Patch) -> Result<(), CacheError> {
        let key = self.key(identity, record);
        self.entries.write().await.insert(key.clone(), produced.clone());
        self.emitter.emit("store", json!({ "plugin": identity, "key": key }));
        Ok(())
    }

    fn observable(&self) -> Option<&dyn Observable> {
        Some(&self.emitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(email: &str) -> Snapshot {
        Snapshot::new(json!({ "email": email }), json!({}))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = MemoryCache::new();
        let record = snapshot("a@b.com");

        assert_eq!(cache.get("domain", &record).await.unwrap(), CacheLookup::Miss);

        let patch = Patch::new().set("domain", "b.com");
        cache.set("domain", &record, &patch).await.unwrap();

        assert_eq!(
            cache.get("domain", &record).await.unwrap(),
            CacheLookup::Hit(patch)
        );
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_custom_key_separates_records() {
        let cache = MemoryCache::new().with_key(|identity, view| {
            format!("{}:{}", identity, view.str_field("email").unwrap_or_default())
        });

        cache
            .set("domain", &snapshot("a@b.com"), &Patch::new().set("domain", "b.com"))
            .await
            .unwrap();

        assert!(matches!(
            cache.get("domain", &snapshot("a@b.com")).await.unwrap(),
            CacheLookup::Hit(_)
        ));
        assert_eq!(
            cache.get("domain", &snapshot("x@y.com")).await.unwrap(),
            CacheLookup::Miss
        );
    }

    #[tokio::test]
    async fn test_emits_events() {
        let cache = MemoryCache::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        cache
            .observable()
            .unwrap()
            .add_listener(Arc::new(move |name: &str, _: &serde_json::Value| {
                sink.lock().unwrap().push(name.to_string())
            }));

        cache.insert("domain", Patch::new()).await;
        cache.get("domain", &snapshot("a@b.com")).await.unwrap();
        cache.get("other", &snapshot("a@b.com")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["hit", "miss"]);
    }
}
