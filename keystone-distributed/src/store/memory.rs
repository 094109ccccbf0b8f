//! In-memory lease store
//!
//! One mutex guards the whole keyspace, which makes every operation atomic in
//! the same sense a Redis script is. Expiry is evaluated lazily against
//! `tokio::time::Instant`, so tests can drive lease timing with paused time.
//! Suitable for a single process or for testing; multi-process deployments
//! need the Redis store.

use crate::config::deadline_after;
use crate::store::{KeyTtl, LeaseStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Live entry for `key`, evicting it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            trace!(key = %key, "Evicting expired key");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn bytes(&mut self, key: &str) -> StoreResult<Option<&mut Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Bytes(b), .. }) => Ok(Some(b)),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    fn hash(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    fn sorted_set(&mut self, key: &str) -> StoreResult<Option<&mut HashMap<String, f64>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::SortedSet(z), .. }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key, "zset")),
        }
    }

    /// Collections disappear once their last member is removed, as in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::SortedSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// In-memory lease store
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    /// Wall-clock anchor; `now()` advances with the tokio clock from here.
    epoch_wall: DateTime<Utc>,
    epoch_instant: Instant,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        debug!("Creating new in-memory lease store");
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
            epoch_wall: Utc::now(),
            epoch_instant: Instant::now(),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        debug!(available = available, "Memory store availability changed");
        self.available.store(available, Ordering::Release);
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        if ks.live(key).is_some() {
            return Ok(false);
        }
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(deadline_after(ttl)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        Ok(ks.bytes(key)?.map(|b| b.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.map(deadline_after),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let existed = ks.live(key).is_some();
        ks.entries.remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let ttl = match ks.live(key) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
        };
        Ok(ttl)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let matches = matches!(ks.live(key), Some(Entry { value: Value::Bytes(b), .. }) if b.as_slice() == token.as_bytes());
        if matches {
            ks.entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        match ks.live(key) {
            Some(entry) if matches!(&entry.value, Value::Bytes(b) if b.as_slice() == token.as_bytes()) => {
                entry.expires_at = Some(deadline_after(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_delete(&self, key: &str, token: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let matches = matches!(ks.live(key), Some(Entry { value: Value::Bytes(b), .. }) if b.as_slice() == token.as_bytes());
        ks.entries.remove(key);
        Ok(matches)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        match ks.sorted_set(key)? {
            Some(z) => {
                z.insert(member.to_string(), score);
            }
            None => {
                let z = HashMap::from([(member.to_string(), score)]);
                ks.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::SortedSet(z),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let mut members: Vec<(String, f64)> = match ks.sorted_set(key)? {
            Some(z) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            None => Vec::new(),
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let removed = match ks.sorted_set(key)? {
            Some(z) => z.remove(member).is_some(),
            None => false,
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        match ks.hash(key)? {
            Some(h) => {
                h.insert(field.to_string(), value.to_string());
            }
            None => {
                let h = HashMap::from([(field.to_string(), value.to_string())]);
                ks.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(h),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        Ok(ks.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let removed = match ks.hash(key)? {
            Some(h) => h.remove(field).is_some(),
            None => false,
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        let mut fields: Vec<String> = match ks.hash(key)? {
            Some(h) => h.keys().cloned().collect(),
            None => Vec::new(),
        };
        fields.sort();
        Ok(fields)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.ensure_available()?;
        let mut ks = self.keyspace.lock();
        Ok(ks.hash(key)?.map(|h| h.clone()).unwrap_or_default())
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.ensure_available()?;
        let elapsed = Instant::now().saturating_duration_since(self.epoch_instant);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self.epoch_wall + elapsed)
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
