//! Lease-backed task payload slots.

use crate::config::deadline_after;
use crate::store::{KeyTtl, LeaseStore, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Task context errors
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Task context not found: {0}")]
    NotFound(String),

    #[error("Task context {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ContextError {
    fn store(op: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { op, source }
    }
}

/// Result type for task context operations.
pub type ContextResult<T> = Result<T, ContextError>;

struct ContextState {
    expires_at: Instant,
    closed: bool,
}

struct ContextInner {
    key: String,
    ttl: Duration,
    store: Arc<dyn LeaseStore>,
    state: Mutex<ContextState>,
}

/// One in-flight task's continuation data, stored under a single key with a TTL.
///
/// Clones share state: closing any clone closes them all. Each [`set`](Self::set)
/// re-arms the TTL, which is how a long task keeps its recovery data alive.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    /// Create a context for `key`; nothing is written until [`set`](Self::set).
    pub fn new(store: Arc<dyn LeaseStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                key: key.into(),
                ttl,
                store,
                state: Mutex::new(ContextState {
                    expires_at: deadline_after(ttl),
                    closed: false,
                }),
            }),
        }
    }

    /// Store key of this context.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// TTL applied on every `set`.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Whether [`close`](Self::close) has been called, or a check found the context expired.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Store `payload` with a fresh TTL.
    pub async fn set(&self, payload: &[u8]) -> ContextResult<()> {
        self.inner
            .store
            .set(&self.inner.key, payload, Some(self.inner.ttl))
            .await
            .map_err(ContextError::store("set"))?;

        self.inner.state.lock().expires_at = deadline_after(self.inner.ttl);
        trace!(key = %self.inner.key, bytes = payload.len(), "Task context updated");
        Ok(())
    }

    /// Read the stored payload.
    pub async fn get(&self) -> ContextResult<Vec<u8>> {
        if self.is_closed() {
            return Err(ContextError::NotFound(self.inner.key.clone()));
        }

        self.inner
            .store
            .get(&self.inner.key)
            .await
            .map_err(ContextError::store("get"))?
            .ok_or_else(|| ContextError::NotFound(self.inner.key.clone()))
    }

    /// Whether the context is still usable.
    ///
    /// Past its local expiry the context closes itself and reports invalid.
    /// Otherwise the store decides: a key without TTL or with a positive one
    /// is valid, a missing key is not.
    pub async fn check(&self) -> ContextResult<bool> {
        let expired = {
            let state = self.inner.state.lock();
            if state.closed {
                return Ok(false);
            }
            Instant::now() > state.expires_at
        };

        if expired {
            debug!(key = %self.inner.key, "Task context expired locally, closing");
            self.close().await?;
            return Ok(false);
        }

        let ttl = self
            .inner
            .store
            .ttl(&self.inner.key)
            .await
            .map_err(ContextError::store("check"))?;

        Ok(match ttl {
            KeyTtl::Persistent => true,
            KeyTtl::Expires(left) => !left.is_zero(),
            KeyTtl::Missing => false,
        })
    }

    /// Delete the payload and mark the context closed.
    ///
    /// Safe to call repeatedly; later calls re-issue the delete, which is a
    /// no-op on a missing key.
    pub async fn close(&self) -> ContextResult<()> {
        self.inner
            .store
            .delete(&self.inner.key)
            .await
            .map_err(ContextError::store("close"))?;

        self.inner.state.lock().closed = true;
        debug!(key = %self.inner.key, "Task context closed");
        Ok(())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("key", &self.inner.key)
            .field("ttl", &self.inner.ttl)
            .field("closed", &self.is_closed())
            .finish()
    }
}
