//! Redis lease store
//!
//! Uses Redis for coordination across processes. Every compare-and-act
//! operation is a single Lua script so the token comparison and the write
//! happen atomically on the server.

use crate::store::{KeyTtl, LeaseStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_redis::{RedisConfig, RedisError, RedisService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const COMPARE_AND_DELETE: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const FORCE_DELETE: &str = r#"
    local owned = 0
    if redis.call("get", KEYS[1]) == ARGV[1] then
        owned = 1
    end
    redis.call("del", KEYS[1])
    return owned
"#;

/// Redis-backed lease store
pub struct RedisStore {
    redis: Arc<RedisService>,
}

impl RedisStore {
    /// Connect a new store using `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built or the server does not answer `PING`.
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        debug!(url = %config.url, "Connecting to Redis lease store");
        let redis = RedisService::new(config).await?;
        Ok(Self::new(Arc::new(redis)))
    }

    /// Create a store over an existing service (shares its pool).
    pub fn new(redis: Arc<RedisService>) -> Self {
        Self { redis }
    }

    /// The underlying service.
    pub fn service(&self) -> &Arc<RedisService> {
        &self.redis
    }
}

#[async_trait]
impl LeaseStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        Ok(self.redis.set_nx_px(key, value, ttl).await?)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.redis.get_bytes(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        Ok(self.redis.set_bytes(key, value, ttl).await?)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.redis.delete(key).await?)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let ttl = match self.redis.pttl(key).await? {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms if ms >= 0 => KeyTtl::Expires(Duration::from_millis(ms as u64)),
            other => {
                return Err(RedisError::UnexpectedReply(format!("PTTL {} returned {}", key, other)).into());
            }
        };
        Ok(ttl)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        let deleted: i64 = self.redis.eval(COMPARE_AND_DELETE, &[key], &[token]).await?;
        trace!(key = %key, deleted = deleted, "compare_and_delete");
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let ttl_ms = (ttl.as_millis() as u64).max(1).to_string();
        let renewed: i64 = self
            .redis
            .eval(COMPARE_AND_EXPIRE, &[key], &[token, ttl_ms.as_str()])
            .await?;
        trace!(key = %key, renewed = renewed, "compare_and_expire");
        Ok(renewed == 1)
    }

    async fn force_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        let owned: i64 = self.redis.eval(FORCE_DELETE, &[key], &[token]).await?;
        Ok(owned == 1)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        Ok(self.redis.zadd(key, member, score).await?)
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        Ok(self.redis.zrange_with_scores(key).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.redis.zrem(key, member).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        Ok(self.redis.hset(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.redis.hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self.redis.hdel(key, field).await?)
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.redis.hkeys(key).await?)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.redis.hgetall(key).await?)
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        let (secs, micros) = self.redis.time().await?;
        DateTime::from_timestamp(secs as i64, (micros * 1_000) as u32).ok_or_else(|| {
            RedisError::UnexpectedReply(format!("TIME returned {} {}", secs, micros)).into()
        })
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
