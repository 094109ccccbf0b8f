//! Redis service wrapping a bb8 pool with the commands lease coordination uses.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, trace};

use crate::{RedisConfig, RedisError, Result};

type Conn<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Redis service providing the connection pool and typed convenience commands.
///
/// Every method checks a connection out of the pool for the duration of a
/// single command, so the service can be shared freely behind an `Arc`.
pub struct RedisService {
    config: RedisConfig,
    pool: Pool<RedisConnectionManager>,
}

impl RedisService {
    /// Build the pool and verify the server answers `PING`.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        config.validate()?;

        let manager = RedisConnectionManager::new(config.connection_url())
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .await
            .map_err(|e| RedisError::Pool(e.to_string()))?;

        let service = Self { config, pool };
        service.ping().await?;

        info!(
            pool_size = service.config.pool_size,
            url = %service.config.url,
            "Redis connection pool created"
        );
        Ok(service)
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// `PING` the server through a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<Conn<'_>> {
        Ok(self.pool.get().await?)
    }

    // Plain keys

    /// `SET key value NX PX ttl`. Returns `true` when the key was created.
    pub async fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut *conn)
            .await?;
        trace!(key = %key, created = reply.is_some(), "SET NX PX");
        Ok(reply.is_some())
    }

    /// `GET key` as raw bytes.
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    /// `SET key value [PX ttl]`.
    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut *conn).await?;
        Ok(())
    }

    /// Delete a key. Returns whether a key was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: u32 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    /// Raw `PTTL` reply: `-2` missing, `-1` no expiry, otherwise milliseconds left.
    pub async fn pttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn.pttl(key).await?;
        Ok(ttl)
    }

    /// Server clock as `(unix_seconds, microseconds)` from `TIME`.
    pub async fn time(&self) -> Result<(u64, u64)> {
        let mut conn = self.conn().await?;
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut *conn).await?;
        Ok((secs, micros))
    }

    /// Execute a Lua script atomically on the server.
    pub async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<T> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(script);
        let result: T = script
            .key(keys)
            .arg(args)
            .invoke_async(&mut *conn)
            .await?;
        Ok(result)
    }

    // Sorted sets

    /// `ZADD key score member`.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    /// `ZRANGE key 0 -1 WITHSCORES`.
    pub async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await?;
        Ok(members)
    }

    /// `ZREM key member`. Returns whether the member was present.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u32 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    // Hashes

    /// Hash set.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.hset(key, field, value).await?;
        Ok(())
    }

    /// Hash get.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    /// Hash delete. Returns whether the field was present.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u32 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    /// Hash field names.
    pub async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let fields: Vec<String> = conn.hkeys(key).await?;
        Ok(fields)
    }

    /// Hash get all.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let entries: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(entries)
    }
}

/// Lease TTLs always go over the wire in milliseconds; a zero TTL is rejected
/// by Redis, so it is rounded up.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
