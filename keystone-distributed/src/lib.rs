//! Distributed coordination on a lease store
//!
//! This crate provides coordination primitives built on a shared key-value
//! store with TTL semantics.
//!
//! ## Features
//!
//! - **Distributed Locks** - Tokenized leases with background renewal and a lifetime cap
//! - **Task Contexts** - Lease-backed payload slots a task can resume from
//! - **Cluster Monitor** - Heartbeats, leader election, and reentry of tasks whose node died
//! - **Pluggable Stores** - Redis for real deployments, in-memory for tests and single processes
//!
//! ## Quick Start
//!
//! ### Distributed Locks
//!
//! ```rust,ignore
//! use keystone_distributed::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RedisStore::connect(keystone_redis::RedisConfig::default()).await?);
//!     let lock = LockBuilder::new().build(store)?;
//!
//!     if lock.acquire("my-resource").await? {
//!         println!("Lock acquired, doing work...");
//!         lock.release().await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Cluster Monitor
//!
//! ```rust,ignore
//! use keystone_distributed::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RedisStore::connect(keystone_redis::RedisConfig::from_env().build()).await?);
//!     let monitor = ClusterMonitor::new(store, MonitorConfig::from_env())?;
//!
//!     monitor.register("rebuild-index", |ctx| async move {
//!         let checkpoint = ctx.get().await.unwrap_or_default();
//!         println!("Resuming from {} bytes of checkpoint", checkpoint.len());
//!     });
//!     monitor.start("search");
//!
//!     let ctx = monitor.watch("rebuild-index", "products", None).await?;
//!     ctx.set(b"shard=3").await?;
//!     monitor.unwatch("rebuild-index", "products").await?;
//!
//!     monitor.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod lock;
pub mod monitor;
pub mod store;
pub mod supervisor;

pub use config::{LockConfig, MonitorConfig};
pub use context::{ContextError, ContextResult, TaskContext};
pub use lock::{DistributedLock, LockBuilder, LockError, LockResult};
pub use monitor::{
    AlertFn, CallOptions, ClusterMonitor, MonitorBuilder, MonitorError, MonitorResult,
    TaskCallback,
};
pub use store::{KeyTtl, LeaseStore, MemoryStore, RedisStore, StoreError, StoreResult};
pub use supervisor::spawn_supervised;
