//! Cluster membership, leader election and crash-surviving task handoff
//!
//! Every [`ClusterMonitor`] in a group heartbeats into a shared sorted set and
//! competes for the group's election lease. The elected node audits the group:
//! it evicts members whose heartbeat went stale, garbage-collects task entries
//! whose context expired, and re-enters tasks whose owner disappeared by
//! running the registered callback locally with the task's stored payload.
//!
//! Store layout for group `G`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `G:nodes` | sorted set | member uid, score = last heartbeat (unix ms, store clock) |
//! | `G:watches` | hash | `G\|method\|tag` to owner uid |
//! | `G` | string | election lease token |
//! | `G\|method\|tag` | string | task payload, expires after `watch_timeout` |
//!
//! Reentered callbacks run at least once per lost task, never exactly once:
//! a leader that dies mid-reentry leaves the entry for the next leader.
//! Callbacks must be idempotent. A callback that fails is not retried here.

use crate::config::MonitorConfig;
use crate::context::{ContextError, TaskContext};
use crate::lock::{DistributedLock, LockError};
use crate::store::{LeaseStore, StoreError, StoreResult};
use crate::supervisor::spawn_supervised;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cluster monitor errors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Method {0} is unregistered")]
    MethodUnregistered(String),

    #[error("Monitor has not been started")]
    NotStarted,

    #[error("Invalid method name {0:?}: '|' is reserved")]
    InvalidMethod(String),

    #[error("Invalid monitor configuration: {0}")]
    Config(String),

    #[error("Monitor {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl MonitorError {
    fn store(op: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { op, source }
    }
}

/// Result type for monitor operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Task callback, invoked with the task's context on reentry.
pub type TaskCallback =
    Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Alert sink for leadership loss, reentries, collected tasks and long-running tasks.
pub type AlertFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-method registration options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Long-running threshold for this method; overrides the monitor-wide one.
    pub watch_warning: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn once when a task of this method runs longer than `threshold`.
    pub fn watch_warning(mut self, threshold: Duration) -> Self {
        self.watch_warning = Some(threshold);
        self
    }
}

struct Registration {
    callback: TaskCallback,
    watch_warning: Option<Duration>,
}

/// A task this process is executing, either for its own caller or as a reentry.
struct LocalWatch {
    id: u64,
    method: String,
    context: TaskContext,
    started_at: Instant,
    warned: bool,
}

fn nodes_key(group: &str) -> String {
    format!("{}:nodes", group)
}

fn watches_key(group: &str) -> String {
    format!("{}:watches", group)
}

fn task_key(group: &str, method: &str, tag: &str) -> String {
    format!("{}|{}|{}", group, method, tag)
}

/// Split `group|method|tag` back into `(method, tag)`.
fn split_task_key<'a>(group: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    key.strip_prefix(group)?.strip_prefix('|')?.split_once('|')
}

struct MonitorInner {
    uid: String,
    store: Arc<dyn LeaseStore>,
    config: MonitorConfig,
    election: DistributedLock,
    is_master: AtomicBool,
    group: OnceLock<String>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    callbacks: RwLock<HashMap<String, Registration>>,
    local_watches: Mutex<HashMap<String, LocalWatch>>,
    next_watch_id: AtomicU64,
    /// Leader-side contexts of tasks owned elsewhere, kept across audits.
    contexts: Mutex<HashMap<String, TaskContext>>,
    /// Members seen alive by the last membership audit.
    nodes: Mutex<HashSet<String>>,
    alert: Option<AlertFn>,
}

impl MonitorInner {
    fn group(&self) -> MonitorResult<&str> {
        self.group
            .get()
            .map(String::as_str)
            .ok_or(MonitorError::NotStarted)
    }

    fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Acquire)
    }

    fn alert(&self, message: &str) {
        warn!(uid = %self.uid, alert = %message, "Monitor alert");
        if let Some(alert) = &self.alert {
            alert(message);
        }
    }

    fn track(&self, key: &str, method: &str, context: TaskContext) -> u64 {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.local_watches.lock().insert(
            key.to_string(),
            LocalWatch {
                id,
                method: method.to_string(),
                context,
                started_at: Instant::now(),
                warned: false,
            },
        );
        id
    }

    /// Forget a local watch unless it has been replaced since `id` was issued.
    fn untrack(&self, key: &str, id: u64) {
        let mut watches = self.local_watches.lock();
        if watches.get(key).is_some_and(|w| w.id == id) {
            watches.remove(key);
        }
    }

    async fn unwatch(&self, method: &str, tag: &str) -> MonitorResult<()> {
        let group = self.group()?;
        let key = task_key(group, method, tag);

        self.store
            .hdel(&watches_key(group), &key)
            .await
            .map_err(MonitorError::store("unwatch"))?;

        // Keep tracking the context until its payload is gone
        let local = self
            .local_watches
            .lock()
            .get(&key)
            .map(|w| (w.id, w.context.clone()));
        if let Some((id, context)) = local {
            context.close().await?;
            self.untrack(&key, id);
        }

        debug!(key = %key, "Unwatched task");
        Ok(())
    }

    async fn tick(self: &Arc<Self>, group: &str) {
        if let Err(e) = self.heartbeat(group).await {
            error!(group = %group, error = %e, "Heartbeat failed");
        }

        self.check_local_watches();

        if self.is_master() {
            self.revalidate(group).await;
        }
        if !self.is_master() {
            self.elect(group).await;
        }
        if !self.is_master() {
            return;
        }

        // A failed membership audit would make every owner look dead
        if let Err(e) = self.check_nodes(group).await {
            error!(group = %group, error = %e, "Membership audit failed");
            return;
        }
        if let Err(e) = self.check_watches(group).await {
            error!(group = %group, error = %e, "Task audit failed");
        }
    }

    async fn heartbeat(&self, group: &str) -> StoreResult<()> {
        let now = self.store.now().await?;
        self.store
            .zadd(&nodes_key(group), &self.uid, now.timestamp_millis() as f64)
            .await
    }

    async fn elect(&self, group: &str) {
        match self.election.acquire(group).await {
            Ok(true) => {
                self.is_master.store(true, Ordering::Release);
                info!(group = %group, uid = %self.uid, "Elected leader");
            }
            Ok(false) => debug!(group = %group, "Election lost, staying follower"),
            Err(e) => error!(group = %group, error = %e, "Election failed"),
        }
    }

    /// Demote if the election lease no longer carries our token.
    async fn revalidate(&self, group: &str) {
        match self.election.check(group).await {
            Ok((_, true)) => {}
            Ok(_) => {
                self.is_master.store(false, Ordering::Release);
                if let Err(e) = self.election.release().await {
                    debug!(group = %group, error = %e, "Releasing lost election lease failed");
                }
                self.contexts.lock().clear();
                self.alert(&format!("Lost leadership of group {}", group));
            }
            Err(e) => error!(group = %group, error = %e, "Leadership check failed"),
        }
    }

    fn check_local_watches(&self) {
        let default = self.config.watch_warning;
        let thresholds: HashMap<String, Option<Duration>> = self
            .callbacks
            .read()
            .iter()
            .map(|(method, r)| (method.clone(), r.watch_warning.or(default)))
            .collect();

        let mut overdue = Vec::new();
        {
            let mut watches = self.local_watches.lock();
            for (key, watch) in watches.iter_mut() {
                let threshold = thresholds.get(&watch.method).copied().unwrap_or(default);
                let Some(threshold) = threshold else {
                    continue;
                };
                let elapsed = watch.started_at.elapsed();
                if !watch.warned && elapsed > threshold {
                    watch.warned = true;
                    overdue.push(format!("Task {} has been running for {:?}", key, elapsed));
                }
            }
        }

        for message in overdue {
            self.alert(&message);
        }
    }

    async fn check_nodes(&self, group: &str) -> StoreResult<()> {
        let key = nodes_key(group);
        let cutoff = self.store.now().await?.timestamp_millis()
            - self.config.heartbeat_timeout.as_millis() as i64;

        let mut alive = HashSet::new();
        for (uid, score) in self.store.zrange_with_scores(&key).await? {
            if !uid.is_empty() && score as i64 > cutoff {
                alive.insert(uid);
                continue;
            }

            info!(group = %group, node = %uid, "Evicting node with stale heartbeat");
            if let Err(e) = self.store.zrem(&key, &uid).await {
                error!(group = %group, node = %uid, error = %e, "Failed to evict node");
            }
        }

        *self.nodes.lock() = alive;
        Ok(())
    }

    async fn check_watches(self: &Arc<Self>, group: &str) -> StoreResult<()> {
        let registry = watches_key(group);
        let entries = self.store.hgetall(&registry).await?;
        self.contexts.lock().retain(|key, _| entries.contains_key(key));

        for (key, owner) in entries {
            let local = self
                .local_watches
                .lock()
                .get(&key)
                .map(|w| w.context.clone());
            let context = match local {
                Some(context) => context,
                None => self
                    .contexts
                    .lock()
                    .entry(key.clone())
                    .or_insert_with(|| {
                        TaskContext::new(self.store.clone(), key.clone(), self.config.watch_timeout)
                    })
                    .clone(),
            };

            match context.check().await {
                Ok(true) => {}
                Ok(false) => {
                    self.alert(&format!("Removing invalid task {}", key));
                    if let Err(e) = context.close().await {
                        error!(key = %key, error = %e, "Failed to close invalid task context");
                    }
                    if let Err(e) = self.store.hdel(&registry, &key).await {
                        error!(key = %key, error = %e, "Failed to remove invalid task");
                    }
                    self.contexts.lock().remove(&key);
                    continue;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Task check failed");
                    continue;
                }
            }

            let owner_alive = self.nodes.lock().contains(&owner);
            if !owner_alive {
                self.reenter(group, &key, &owner, context);
            }
        }

        Ok(())
    }

    fn reenter(self: &Arc<Self>, group: &str, key: &str, owner: &str, context: TaskContext) {
        if self.local_watches.lock().contains_key(key) {
            return;
        }

        let Some((method, tag)) = split_task_key(group, key) else {
            warn!(key = %key, "Malformed task key, skipping reentry");
            return;
        };
        let callback = self.callbacks.read().get(method).map(|r| r.callback.clone());
        let Some(callback) = callback else {
            warn!(key = %key, method = %method, "No callback registered, skipping reentry");
            return;
        };

        self.alert(&format!("Re-entering task {} (owner {} is gone)", key, owner));

        let id = self.track(key, method, context.clone());
        let guard = WatchGuard {
            inner: self.clone(),
            key: key.to_string(),
            id,
        };
        let (method, tag) = (method.to_string(), tag.to_string());

        spawn_supervised("task-reentry", async move {
            callback(context).await;

            // On failure the entry stays for the next audit
            if let Err(e) = guard.inner.unwatch(&method, &tag).await {
                error!(key = %guard.key, error = %e, "Failed to unwatch re-entered task");
            }
            drop(guard);
        });
    }
}

/// Removes a reentry's local watch however the callback ends.
struct WatchGuard {
    inner: Arc<MonitorInner>,
    key: String,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.inner.untrack(&self.key, self.id);
    }
}

async fn run(inner: Arc<MonitorInner>, group: String) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => inner.tick(&group).await,
        }
    }

    info!(group = %group, uid = %inner.uid, "Cluster monitor loop stopped");
}

/// Heartbeats, elects a leader and hands off tasks of vanished nodes.
///
/// Dropping the monitor stops its loop without any cleanup, exactly like a
/// crashed process: the election lease is left to expire, and membership and
/// watch entries stay behind for the leader to deal with. Use
/// [`stop`](Self::stop) for a clean shutdown.
///
/// # Examples
///
/// ```rust,ignore
/// use keystone_distributed::{ClusterMonitor, MemoryStore};
/// use std::sync::Arc;
///
/// let monitor = ClusterMonitor::builder(Arc::new(MemoryStore::new()))
///     .on_alert(|msg| eprintln!("{msg}"))
///     .build()?;
///
/// monitor.register("export", |ctx| async move {
///     let cursor = ctx.get().await.unwrap_or_default();
///     // resume the export from `cursor`
/// });
/// monitor.start("reports");
///
/// let ctx = monitor.watch("export", "2024-06", None).await?;
/// ctx.set(b"page=1").await?;
/// // ...
/// monitor.unwatch("export", "2024-06").await?;
/// ```
pub struct ClusterMonitor {
    inner: Arc<MonitorInner>,
}

impl ClusterMonitor {
    /// Create a monitor with `config`.
    pub fn new(store: Arc<dyn LeaseStore>, config: MonitorConfig) -> MonitorResult<Self> {
        Self::builder(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn LeaseStore>) -> MonitorBuilder {
        MonitorBuilder::new(store)
    }

    /// Random identifier of this node, fixed for the monitor's lifetime.
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// Group passed to [`start`](Self::start), if started.
    pub fn group(&self) -> Option<String> {
        self.inner.group.get().cloned()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Register the callback run when a task of `method` is re-entered.
    pub fn register<F, Fut>(&self, method: impl Into<String>, callback: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_with(method, CallOptions::default(), callback);
    }

    /// Register a callback with per-method options.
    pub fn register_with<F, Fut>(&self, method: impl Into<String>, options: CallOptions, callback: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let method = method.into();
        let callback: TaskCallback = Arc::new(
            move |ctx: TaskContext| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(callback(ctx))
            },
        );

        debug!(method = %method, "Registered task callback");
        self.inner.callbacks.write().insert(
            method,
            Registration {
                callback,
                watch_warning: options.watch_warning,
            },
        );
    }

    pub fn deregister(&self, method: &str) {
        self.inner.callbacks.write().remove(method);
    }

    /// Join `group` and start the background loop.
    ///
    /// Only the first call has any effect; a stopped monitor cannot be
    /// restarted. Must be called within a tokio runtime.
    pub fn start(&self, group: impl Into<String>) {
        let group = group.into();
        if self.inner.group.set(group.clone()).is_err() {
            debug!(group = %group, "Cluster monitor already started");
            return;
        }

        info!(group = %group, uid = %self.inner.uid, "Starting cluster monitor");
        let handle = spawn_supervised("cluster-monitor", run(self.inner.clone(), group));
        *self.inner.task.lock() = Some(handle);
    }

    /// Stop the loop, give up leadership and leave the group.
    ///
    /// Watch entries are left untouched; unwatch tasks first to avoid their
    /// reentry elsewhere.
    pub async fn stop(&self) -> MonitorResult<()> {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Cluster monitor loop did not shut down cleanly");
        }

        let released = self.inner.election.release().await;
        if self.inner.is_master.swap(false, Ordering::AcqRel) {
            info!(uid = %self.inner.uid, "Stepped down as leader");
        }

        if let Some(group) = self.inner.group.get() {
            self.inner
                .store
                .zrem(&nodes_key(group), &self.inner.uid)
                .await
                .map_err(MonitorError::store("stop"))?;
            info!(group = %group, uid = %self.inner.uid, "Cluster monitor stopped");
        }

        released?;
        Ok(())
    }

    /// Whether this node currently leads its group.
    pub fn is_master(&self) -> bool {
        self.inner.is_master()
    }

    /// Register a task owned by this node and return its context.
    ///
    /// The payload slot is always seeded (empty when `payload` is `None`)
    /// so the task survives audits until its first update.
    pub async fn watch(
        &self,
        method: &str,
        tag: &str,
        payload: Option<&[u8]>,
    ) -> MonitorResult<TaskContext> {
        if method.contains('|') {
            return Err(MonitorError::InvalidMethod(method.to_string()));
        }
        if !self.inner.callbacks.read().contains_key(method) {
            return Err(MonitorError::MethodUnregistered(method.to_string()));
        }

        let group = self.inner.group()?;
        let key = task_key(group, method, tag);

        // The payload must exist before an audit can see the registry entry
        let context = TaskContext::new(
            self.inner.store.clone(),
            key.clone(),
            self.inner.config.watch_timeout,
        );
        context.set(payload.unwrap_or_default()).await?;

        if let Err(e) = self
            .inner
            .store
            .hset(&watches_key(group), &key, &self.inner.uid)
            .await
        {
            if let Err(close_err) = context.close().await {
                debug!(
                    key = %key,
                    error = %close_err,
                    "Failed to drop payload of unregistered task"
                );
            }
            return Err(MonitorError::Store {
                op: "watch",
                source: e,
            });
        }
        self.inner.track(&key, method, context.clone());

        debug!(key = %key, "Watching task");
        Ok(context)
    }

    /// Remove a task from the registry and close its local context, if any.
    ///
    /// Unwatching an unknown task is not an error.
    pub async fn unwatch(&self, method: &str, tag: &str) -> MonitorResult<()> {
        self.inner.unwatch(method, tag).await
    }

    /// Keys (`group|method|tag`) of every registered task in the group.
    pub async fn watch_list(&self) -> MonitorResult<Vec<String>> {
        let group = self.inner.group()?;
        let mut keys = self
            .inner
            .store
            .hkeys(&watches_key(group))
            .await
            .map_err(MonitorError::store("watch_list"))?;
        keys.sort();
        Ok(keys)
    }
}

impl Drop for ClusterMonitor {
    fn drop(&mut self) {
        // Leave the lease and group entries behind, as a crash would
        self.inner.cancel.cancel();
        self.inner.election.abandon();
    }
}

/// Cluster monitor builder
pub struct MonitorBuilder {
    store: Arc<dyn LeaseStore>,
    config: MonitorConfig,
    alert: Option<AlertFn>,
}

impl MonitorBuilder {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            config: MonitorConfig::default(),
            alert: None,
        }
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn watch_timeout(mut self, timeout: Duration) -> Self {
        self.config.watch_timeout = timeout;
        self
    }

    pub fn watch_warning(mut self, threshold: Duration) -> Self {
        self.config.watch_warning = Some(threshold);
        self
    }

    /// Receive alert messages (in addition to the `warn!` log line).
    pub fn on_alert<F>(mut self, alert: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.alert = Some(Arc::new(alert));
        self
    }

    pub fn build(self) -> MonitorResult<ClusterMonitor> {
        self.config.validate().map_err(MonitorError::Config)?;
        let election = DistributedLock::new(self.store.clone(), self.config.election_lock())?;

        Ok(ClusterMonitor {
            inner: Arc::new(MonitorInner {
                uid: Uuid::new_v4().simple().to_string(),
                store: self.store,
                config: self.config,
                election,
                is_master: AtomicBool::new(false),
                group: OnceLock::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                callbacks: RwLock::new(HashMap::new()),
                local_watches: Mutex::new(HashMap::new()),
                next_watch_id: AtomicU64::new(0),
                contexts: Mutex::new(HashMap::new()),
                nodes: Mutex::new(HashSet::new()),
                alert: self.alert,
            }),
        })
    }
}
