//! Shared key/value store boundary (leases and the durable cache tier).
//!
//! The production implementation is Redis (`cadence-infra`, `redis` feature); the
//! in-memory store here is used for development and tests and supports fault
//! injection so fallback policies can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

/// Operations the coordination core needs from the shared KV store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if the key does not exist.
    ///
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete `key` only if its current value equals `expected`, atomically.
    ///
    /// Returns `true` when the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Read a key. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read a key with its remaining lifetime (`None` if the key never expires).
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(String, Option<Duration>)>, StoreError>;

    /// Unconditionally set a key with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).compare_and_delete(key, expected).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(String, Option<Duration>)>, StoreError> {
        (**self).get_with_ttl(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-memory KV store for tests/dev.
///
/// Expiry uses the tokio clock, so paused-time tests can advance past TTLs.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    unavailable: AtomicBool,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(existing) if existing.expires_at > now && existing.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(existing) if existing.expires_at > now => Ok(Some(existing.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(String, Option<Duration>)>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(existing) if existing.expires_at > now => Ok(Some((
                existing.value.clone(),
                Some(existing.expires_at - now),
            ))),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = Instant::now() + ttl;
        self.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_with_ttl_reports_remaining_lifetime() {
        let store = InMemoryKvStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.get_with_ttl("k").await.unwrap(),
            Some(("v".to_string(), Some(Duration::from_secs(6))))
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(store.get_with_ttl("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_existing_and_expiry() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_and_delete_only_matches_current_value() {
        let store = InMemoryKvStore::new();
        store.set("k", "mine", Duration::from_secs(10)).await.unwrap();

        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());

        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryKvStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.set_if_absent("k", "v", Duration::from_secs(1)).await.is_err());

        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
