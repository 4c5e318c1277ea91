//! Two-tier read-through cache.
//!
//! Lookup order is local LRU (hit promotes), then the durable KV tier (hit backfills
//! local for at most the durable entry's remaining TTL), then miss. Negative results are cached as [`CachedValue::Negative`], which
//! is a different answer from "absent". The durable tier is optional; its failures
//! are logged and treated as misses, never surfaced to callers.

mod key;
mod lru;

pub use key::{coordinate_key, round_coordinate};
pub use lru::LruTier;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

/// A cached lookup outcome.
///
/// Durable encoding is `{"kind":"found","value":..}` or `{"kind":"negative"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue<V> {
    Found(V),
    /// The upstream answered and had nothing for this key.
    Negative,
}

impl<V> CachedValue<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            CachedValue::Found(v) => Some(v),
            CachedValue::Negative => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, CachedValue::Negative)
    }
}

/// Decoder for durable entries written in an older format.
pub type LegacyDecoder<V> = Arc<dyn Fn(&str) -> Option<CachedValue<V>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReadThroughCacheConfig {
    /// Maximum local entries.
    pub capacity: usize,
    /// Local lifetime of values backfilled from the durable tier.
    pub backfill_ttl: Duration,
    /// Prefix for durable keys (`{namespace}:{key}`).
    pub namespace: String,
}

impl Default for ReadThroughCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            backfill_ttl: Duration::from_secs(60 * 60),
            namespace: "cache".to_string(),
        }
    }
}

impl ReadThroughCacheConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_backfill_ttl(mut self, ttl: Duration) -> Self {
        self.backfill_ttl = ttl;
        self
    }
}

pub struct ReadThroughCache<V> {
    local: Mutex<LruTier<CachedValue<V>>>,
    durable: Option<Arc<dyn KeyValueStore>>,
    legacy: Option<LegacyDecoder<V>>,
    config: ReadThroughCacheConfig,
}

impl<V> std::fmt::Debug for ReadThroughCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("config", &self.config)
            .field("durable", &self.durable.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> ReadThroughCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Local-only cache.
    pub fn new(config: ReadThroughCacheConfig) -> Self {
        Self {
            local: Mutex::new(LruTier::new(config.capacity)),
            durable: None,
            legacy: None,
            config,
        }
    }

    pub fn with_durable(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Accept durable entries that are not a [`CachedValue`] envelope.
    pub fn with_legacy_decoder(
        mut self,
        decoder: impl Fn(&str) -> Option<CachedValue<V>> + Send + Sync + 'static,
    ) -> Self {
        self.legacy = Some(Arc::new(decoder));
        self
    }

    pub fn config(&self) -> &ReadThroughCacheConfig {
        &self.config
    }

    pub async fn get(&self, key: &str) -> Option<CachedValue<V>> {
        let local_hit = self.local().get(key, Instant::now());
        if let Some(hit) = local_hit {
            debug!(key, "cache hit (local)");
            return Some(hit);
        }

        let store = self.durable.as_ref()?;
        let (raw, remaining) = match store.get_with_ttl(&self.durable_key(key)).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "durable cache read failed; treating as miss");
                return None;
            }
        };

        let value = self.decode(key, &raw)?;
        debug!(key, "cache hit (durable); backfilling local");
        // never outlive the durable entry
        let local_ttl = remaining.map_or(self.config.backfill_ttl, |left| {
            left.min(self.config.backfill_ttl)
        });
        self.local()
            .insert(key.to_string(), value.clone(), Instant::now() + local_ttl);
        Some(value)
    }

    /// Write both tiers. Durable failures are logged only.
    pub async fn set(&self, key: &str, value: CachedValue<V>, ttl: Duration) {
        self.local()
            .insert(key.to_string(), value.clone(), Instant::now() + ttl);

        let Some(store) = &self.durable else {
            return;
        };
        let encoded = match serde_json::to_string(&value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, error = %err, "failed to encode cache entry");
                return;
            }
        };
        if let Err(err) = store.set(&self.durable_key(key), &encoded, ttl).await {
            warn!(key, error = %err, "durable cache write failed");
        }
    }

    /// Return the cached outcome, or run `loader` and cache what it yields.
    ///
    /// `loader` returns `None` for a transient failure; nothing is cached then, so
    /// the next call retries upstream.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Option<CachedValue<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<(CachedValue<V>, Duration)>>,
    {
        if let Some(hit) = self.get(key).await {
            return Some(hit);
        }
        let (value, ttl) = loader().await?;
        self.set(key, value.clone(), ttl).await;
        Some(value)
    }

    /// Drop the local entry. The durable tier expires on its own TTL.
    pub fn invalidate_local(&self, key: &str) {
        self.local().remove(key);
    }

    pub fn local_len(&self) -> usize {
        self.local().len()
    }

    fn decode(&self, key: &str, raw: &str) -> Option<CachedValue<V>> {
        if let Ok(value) = serde_json::from_str::<CachedValue<V>>(raw) {
            return Some(value);
        }
        if let Some(value) = self.legacy.as_ref().and_then(|decode| decode(raw)) {
            debug!(key, "decoded legacy durable cache entry");
            return Some(value);
        }
        warn!(key, "undecodable durable cache entry; treating as miss");
        None
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn local(&self) -> MutexGuard<'_, LruTier<CachedValue<V>>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
