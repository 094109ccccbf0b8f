//! Lease store backends
//!
//! Every coordination primitive in this crate talks to the shared store
//! through [`LeaseStore`]. Two backends are provided:
//!
//! - **Redis**: the distributed backend; compare-and-act operations run as Lua scripts
//! - **Memory**: a single-process backend with identical semantics, for tests and local runs
//!
//! Check-then-act operations (`compare_and_delete`, `compare_and_expire`,
//! `force_delete`) must be atomic on the store side. Backends never emulate
//! them with a client-side read followed by a write.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis backend error.
    #[error(transparent)]
    Redis(#[from] keystone_redis::RedisError),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of a different type than the operation expects.
    #[error("Wrong type for key {key}: expected {expected}")]
    WrongType {
        /// Offending key.
        key: String,
        /// Type the operation expected.
        expected: &'static str,
    },
}

/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or already expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key exists and expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Whether the key is present in the store.
    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }
}

/// Shared key-value store with lease (TTL) semantics.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Store `value` under `key` with `ttl` only if the key is absent.
    /// Returns `true` when the key was created.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Read a value. Absent and expired keys read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Overwrite a value. `ttl = None` stores it without expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Atomically delete `key` only if its value equals `token`.
    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// Atomically re-arm the TTL of `key` only if its value equals `token`.
    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Atomically delete `key` whatever it holds, reporting whether its value
    /// equalled `token` at the time of deletion.
    async fn force_delete(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// All members of a sorted set with their scores, lowest score first.
    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>>;

    /// Remove a sorted-set member. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Set a hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Read a hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Delete a hash field. Returns whether it was present.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// All field names of a hash.
    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    /// All fields and values of a hash.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// The store's wall clock. Heartbeats are stamped with it so that nodes
    /// with skewed local clocks still agree on membership age.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    /// Backend name for logging.
    fn store_type(&self) -> &'static str;
}
