//! Redis-backed shared KV store (leases and the durable cache tier).
//!
//! - acquire: `SET key value NX PX ttl`
//! - release: Lua compare-and-delete, atomic on the server
//! - cache: `GET` + `PTTL` in one `MULTI` / `SET key value PX ttl`
//!
//! A single multiplexed connection is shared by all callers and reconnects are left
//! to the caller's retry cadence (every coordinator tick).

use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::MultiplexedConnection;
use ::redis::{ErrorKind, RedisError, Script};
use tracing::instrument;

use cadence_coordination::{KeyValueStore, StoreError};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisKvStore {
    conn: MultiplexedConnection,
    compare_and_delete: Script,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    #[instrument(skip(self, value), err)]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self, expected), err)]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(deleted == 1)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    #[instrument(skip(self), err)]
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(String, Option<Duration>)>, StoreError> {
        let mut conn = self.conn.clone();
        let (value, pttl): (Option<String>, i64) = ::redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(value.map(|value| (value, remaining_from_pttl(pttl))))
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

/// Redis rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `PTTL` answers -1 for "no expiry" and -2 for "no key".
fn remaining_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
        || err.kind() == ErrorKind::ClusterDown
    {
        StoreError::unavailable(format!("redis unavailable: {err}"))
    } else if err.kind() == ErrorKind::TypeError {
        StoreError::Serialization(format!("unexpected redis reply: {err}"))
    } else {
        StoreError::command(format!("redis command failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_unavailable() {
        let err = RedisError::from((ErrorKind::IoError, "connection refused"));
        assert!(matches!(map_redis_error(err), StoreError::Unavailable(_)));
    }

    #[test]
    fn reply_type_errors_are_serialization() {
        let err = RedisError::from((ErrorKind::TypeError, "not a string"));
        assert!(matches!(map_redis_error(err), StoreError::Serialization(_)));
    }

    #[test]
    fn pttl_sentinels_mean_no_expiry() {
        assert_eq!(remaining_from_pttl(1500), Some(Duration::from_millis(1500)));
        assert_eq!(remaining_from_pttl(-1), None);
        assert_eq!(remaining_from_pttl(-2), None);
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
