//! Renewable distributed locks
//!
//! A [`DistributedLock`] holds at most one lease at a time. Acquiring writes a
//! fresh ownership token with `SET NX` semantics and starts a background
//! renewal loop; the token stored in the lease store is the only proof of
//! ownership, so release and renewal are compare-and-act operations on the
//! store and never trust local state alone.
//!
//! Leases are not fenced. A holder that stalls for longer than the lease
//! duration can still believe it owns the key after someone else acquired it;
//! protected resources that need fencing must check a generation of their own.

use crate::config::LockConfig;
use crate::store::{LeaseStore, StoreError};
use crate::supervisor::spawn_supervised;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Invalid lock configuration: {0}")]
    Config(String),
}

impl LockError {
    fn store(op: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { op, source }
    }
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Lease currently held by a lock instance.
struct Lease {
    key: String,
    token: String,
    acquired_at: Instant,
    renewal: CancellationToken,
}

struct LockInner {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    /// Set while an acquisition is in flight or a lease is held.
    busy: AtomicBool,
    lease: Mutex<Option<Lease>>,
}

impl LockInner {
    /// Drop local holder state, but only if it still belongs to `token`.
    fn forget(&self, token: &str) -> Option<Lease> {
        let mut guard = self.lease.lock();
        if guard.as_ref().is_some_and(|l| l.token == token) {
            let lease = guard.take();
            self.busy.store(false, Ordering::Release);
            if let Some(lease) = &lease {
                lease.renewal.cancel();
            }
            lease
        } else {
            None
        }
    }

    fn held_token(&self, key: &str) -> Option<String> {
        self.lease
            .lock()
            .as_ref()
            .filter(|l| l.key == key)
            .map(|l| l.token.clone())
    }

    async fn release(&self, lease: Lease) -> LockResult<()> {
        lease.renewal.cancel();
        let released = self
            .store
            .compare_and_delete(&lease.key, &lease.token)
            .await
            .map_err(LockError::store("release"))?;

        if released {
            debug!(key = %lease.key, "Released lock");
        } else {
            warn!(key = %lease.key, "Lock was no longer held at release (expired or taken over)");
        }
        Ok(())
    }
}

/// A renewable, tokenized lease on one key at a time.
///
/// # Examples
///
/// ```rust,ignore
/// use keystone_distributed::{DistributedLock, LockBuilder, MemoryStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let store = Arc::new(MemoryStore::new());
/// let lock = LockBuilder::new()
///     .lease_duration(Duration::from_secs(30))
///     .renew_interval(Duration::from_secs(10))
///     .build(store)?;
///
/// if lock.acquire("reports:nightly").await? {
///     // Critical section; the lease renews itself in the background
///     lock.release().await?;
/// }
/// ```
pub struct DistributedLock {
    inner: Arc<LockInner>,
}

impl DistributedLock {
    /// Create a lock over `store`.
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> LockResult<Self> {
        config.validate().map_err(LockError::Config)?;
        Ok(Self {
            inner: Arc::new(LockInner {
                store,
                config,
                busy: AtomicBool::new(false),
                lease: Mutex::new(None),
            }),
        })
    }

    /// Lease settings in use.
    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Key of the lease this instance currently holds.
    pub fn held_key(&self) -> Option<String> {
        self.inner.lease.lock().as_ref().map(|l| l.key.clone())
    }

    /// Whether this instance believes it holds a lease.
    pub fn is_held(&self) -> bool {
        self.inner.lease.lock().is_some()
    }

    /// Try to take the lease on `key`.
    ///
    /// Returns `Ok(false)` without touching the store when this instance is
    /// already holding (or acquiring) a lease, and `Ok(false)` when another
    /// holder owns `key`. On success a renewal loop keeps the lease alive
    /// until it is released, lost, or reaches `max_lifetime`.
    pub async fn acquire(&self, key: &str) -> LockResult<bool> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(key = %key, "Lock instance already busy, not acquiring");
            return Ok(false);
        }

        let token = new_token();
        let created = match self
            .inner
            .store
            .set_if_absent(key, token.as_bytes(), self.inner.config.lease_duration)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.inner.busy.store(false, Ordering::Release);
                return Err(LockError::Store {
                    op: "acquire",
                    source: e,
                });
            }
        };

        if !created {
            self.inner.busy.store(false, Ordering::Release);
            debug!(key = %key, "Failed to acquire lock (already held)");
            return Ok(false);
        }

        let acquired_at = Instant::now();
        let renewal = CancellationToken::new();
        *self.inner.lease.lock() = Some(Lease {
            key: key.to_string(),
            token: token.clone(),
            acquired_at,
            renewal: renewal.clone(),
        });

        spawn_supervised(
            "lock-renewal",
            renew(self.inner.clone(), key.to_string(), token, acquired_at, renewal),
        );

        info!(key = %key, "Acquired lock");
        Ok(true)
    }

    /// Release the held lease if the store still carries this instance's token.
    ///
    /// Local holder state is dropped even when the store call fails; the
    /// lease then simply runs out its TTL. Calling this while holding nothing
    /// is a no-op.
    pub async fn release(&self) -> LockResult<()> {
        let lease = {
            let mut guard = self.inner.lease.lock();
            let lease = guard.take();
            if lease.is_some() {
                self.inner.busy.store(false, Ordering::Release);
            }
            lease
        };

        match lease {
            Some(lease) => self.inner.release(lease).await,
            None => Ok(()),
        }
    }

    /// Delete `key` whoever holds it.
    ///
    /// For a foreign key this is an unconditional delete and reports `false`.
    /// For the key this instance holds, the delete and the token comparison
    /// happen in one atomic step; the result says whether this instance was
    /// still the owner, and local holder state is dropped either way.
    pub async fn force_release(&self, key: &str) -> LockResult<bool> {
        let Some(token) = self.inner.held_token(key) else {
            self.inner
                .store
                .delete(key)
                .await
                .map_err(LockError::store("force_release"))?;
            info!(key = %key, "Force-released foreign lock");
            return Ok(false);
        };

        let owner = self
            .inner
            .store
            .force_delete(key, &token)
            .await
            .map_err(LockError::store("force_release"))?;
        self.inner.forget(&token);

        info!(key = %key, owner = owner, "Force-released held lock");
        Ok(owner)
    }

    /// Report `(exists, is_owner)` for `key`.
    ///
    /// Only the key this instance holds is looked up; any other key reports
    /// `(false, false)` because foreign ownership is never queried.
    pub async fn check(&self, key: &str) -> LockResult<(bool, bool)> {
        let Some(token) = self.inner.held_token(key) else {
            return Ok((false, false));
        };

        let value = self
            .inner
            .store
            .get(key)
            .await
            .map_err(LockError::store("check"))?;

        Ok(match value {
            None => (false, false),
            Some(v) => (true, v == token.as_bytes()),
        })
    }

    /// Stop renewing and forget the held lease without touching the store.
    /// The lease stays with its token until it expires.
    pub(crate) fn abandon(&self) {
        let lease = self.inner.lease.lock().take();
        if let Some(lease) = lease {
            lease.renewal.cancel();
            self.inner.busy.store(false, Ordering::Release);
            debug!(key = %lease.key, "Abandoned lock, lease left to expire");
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        // Best effort release on drop
        let Some(lease) = self.inner.lease.lock().take() else {
            return;
        };
        lease.renewal.cancel();
        if !self.inner.config.release_on_drop {
            debug!(key = %lease.key, "Lock dropped, lease left to expire");
            return;
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                if let Err(e) = inner.release(lease).await {
                    warn!(error = %e, "Failed to release lock on drop");
                }
            });
        }
    }
}

/// Renewal loop for one acquisition.
async fn renew(
    inner: Arc<LockInner>,
    key: String,
    token: String,
    acquired_at: Instant,
    cancel: CancellationToken,
) {
    let period = inner.config.renew_interval;
    let deadline = inner
        .config
        .max_lifetime
        .and_then(|max| acquired_at.checked_add(max));

    let mut ticker = tokio::time::interval_at(acquired_at + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!(key = %key, "Lock renewal cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }

        if deadline.is_some_and(|d| Instant::now() > d) {
            info!(key = %key, "Lock reached its max lifetime, releasing");
            if let Some(lease) = inner.forget(&token)
                && let Err(e) = inner.release(lease).await
            {
                error!(key = %key, error = %e, "Failed to release expired lock");
            }
            break;
        }

        match inner
            .store
            .compare_and_expire(&key, &token, inner.config.lease_duration)
            .await
        {
            Ok(true) => trace!(key = %key, "Renewed lock"),
            Ok(false) => {
                warn!(key = %key, "Lock lost (token no longer matches), stopping renewal");
                inner.forget(&token);
                break;
            }
            // Keep the lease: a short store outage must not cause abdication
            Err(e) => error!(key = %key, error = %e, "Lock renewal failed, retrying next tick"),
        }
    }
}

/// Unique lease token: `{unix_seconds}-{10 random alphanumerics}`.
fn new_token() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp(), suffix)
}

/// Distributed lock builder
pub struct LockBuilder {
    config: LockConfig,
}

impl LockBuilder {
    /// Create new lock builder with default lease settings.
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn with_config(config: LockConfig) -> Self {
        Self { config }
    }

    /// Set the lease TTL.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.config.lease_duration = lease_duration;
        self
    }

    /// Set the renewal period.
    pub fn renew_interval(mut self, renew_interval: Duration) -> Self {
        self.config.renew_interval = renew_interval;
        self
    }

    /// Cap how long one acquisition may be held.
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.config.max_lifetime = Some(max_lifetime);
        self
    }

    /// Never cap the lifetime; the lease lives until released or lost.
    pub fn unbounded(mut self) -> Self {
        self.config.max_lifetime = None;
        self
    }

    /// Whether dropping the lock releases its lease (default) or leaves it to expire.
    pub fn release_on_drop(mut self, release: bool) -> Self {
        self.config.release_on_drop = release;
        self
    }

    /// Build the lock
    pub fn build(self, store: Arc<dyn LeaseStore>) -> LockResult<DistributedLock> {
        DistributedLock::new(store, self.config)
    }
}

impl Default for LockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyTtl, MemoryStore};
    use futures::future::join_all;

    fn fast_lock(store: &Arc<MemoryStore>) -> DistributedLock {
        LockBuilder::new()
            .lease_duration(Duration::from_millis(300))
            .renew_interval(Duration::from_millis(100))
            .max_lifetime(Duration::from_secs(60))
            .build(store.clone())
            .unwrap()
    }

    #[test]
    fn test_lock_builder() {
        let builder = LockBuilder::new()
            .lease_duration(Duration::from_secs(60))
            .renew_interval(Duration::from_secs(20))
            .unbounded();

        assert_eq!(builder.config.lease_duration, Duration::from_secs(60));
        assert_eq!(builder.config.renew_interval, Duration::from_secs(20));
        assert_eq!(builder.config.max_lifetime, None);
    }

    #[test]
    fn test_builder_rejects_bad_timings() {
        let store = Arc::new(MemoryStore::new());
        let result = LockBuilder::new()
            .lease_duration(Duration::from_secs(1))
            .renew_interval(Duration::from_secs(2))
            .build(store);
        assert!(matches!(result, Err(LockError::Config(_))));
    }

    #[test]
    fn test_token_format() {
        let token = new_token();
        let (ts, suffix) = token.split_once('-').unwrap();
        assert!(ts.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(new_token(), new_token());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);

        assert!(lock.acquire("res").await.unwrap());
        assert_eq!(lock.held_key().as_deref(), Some("res"));
        assert_eq!(lock.check("res").await.unwrap(), (true, true));

        lock.release().await.unwrap();
        assert!(!lock.is_held());
        assert_eq!(lock.check("res").await.unwrap(), (false, false));
        assert_eq!(store.get("res").await.unwrap(), None);

        // Idempotent
        lock.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_on_same_instance_fails() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);

        assert!(lock.acquire("a").await.unwrap());
        assert!(!lock.acquire("b").await.unwrap());
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(lock.held_key().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion() {
        let store = Arc::new(MemoryStore::new());
        let locks: Vec<_> = (0..8).map(|_| fast_lock(&store)).collect();

        let results = join_all(locks.iter().map(|l| l.acquire("contended"))).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_lease() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);
        assert!(lock.acquire("renewed").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1050)).await;

        match store.ttl("renewed").await.unwrap() {
            KeyTtl::Expires(left) => assert!(left > Duration::from_millis(200), "ttl {:?}", left),
            other => panic!("lease missing: {:?}", other),
        }
        assert_eq!(lock.check("renewed").await.unwrap(), (true, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lifetime_enforced() {
        let store = Arc::new(MemoryStore::new());
        let lock = LockBuilder::new()
            .lease_duration(Duration::from_millis(300))
            .renew_interval(Duration::from_millis(100))
            .max_lifetime(Duration::from_millis(500))
            .build(store.clone())
            .unwrap();

        assert!(lock.acquire("capped").await.unwrap());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(lock.check("capped").await.unwrap(), (true, true));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get("capped").await.unwrap(), None);
        assert!(!lock.is_held());

        // The instance can take a new lease afterwards
        assert!(lock.acquire("capped").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_release_protection() {
        let store = Arc::new(MemoryStore::new());
        let owner = fast_lock(&store);
        let other = fast_lock(&store);

        assert!(owner.acquire("shared").await.unwrap());

        // `release` on an instance that holds nothing never touches the key
        other.release().await.unwrap();
        assert!(store.get("shared").await.unwrap().is_some());
        assert_eq!(other.check("shared").await.unwrap(), (false, false));

        // `force_release` removes it regardless of owner
        assert!(!other.force_release("shared").await.unwrap());
        assert_eq!(store.get("shared").await.unwrap(), None);

        // The owner notices on its next renewal and stops holding
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!owner.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_release_own_key_reports_owner() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);

        assert!(lock.acquire("mine").await.unwrap());
        assert!(lock.force_release("mine").await.unwrap());
        assert!(!lock.is_held());
        assert_eq!(store.get("mine").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lost_to_overwrite() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);
        assert!(lock.acquire("stolen").await.unwrap());

        store
            .set("stolen", b"someone-else", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!lock.is_held());
        // Release after loss must not delete the other holder's lease
        lock.release().await.unwrap();
        assert_eq!(store.get("stolen").await.unwrap(), Some(b"someone-else".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_survives_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);
        assert!(lock.acquire("flaky").await.unwrap());

        // Shorter than the lease: renewals fail but the holder keeps the lease
        store.set_available(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lock.is_held());
        store.set_available(true);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(lock.is_held());
        assert_eq!(lock.check("flaky").await.unwrap(), (true, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_error_resets_state() {
        let store = Arc::new(MemoryStore::new());
        let lock = fast_lock(&store);

        store.set_available(false);
        let err = lock.acquire("down").await.unwrap_err();
        assert!(matches!(err, LockError::Store { op: "acquire", .. }));

        store.set_available(true);
        assert!(lock.acquire("down").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_lease() {
        let store = Arc::new(MemoryStore::new());
        {
            let lock = fast_lock(&store);
            assert!(lock.acquire("scoped").await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("scoped").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_release_leaves_lease_to_expire() {
        let store = Arc::new(MemoryStore::new());
        {
            let lock = LockBuilder::new()
                .lease_duration(Duration::from_millis(300))
                .renew_interval(Duration::from_millis(100))
                .release_on_drop(false)
                .build(store.clone())
                .unwrap();
            assert!(lock.acquire("scoped").await.unwrap());
        }

        // Still held, but no longer renewed
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get("scoped").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("scoped").await.unwrap(), None);
    }
}
