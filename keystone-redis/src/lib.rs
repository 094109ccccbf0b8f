//! # Keystone Redis
//!
//! Redis client plumbing for the Keystone coordination primitives.
//!
//! ## Features
//!
//! - **Connection Pooling**: Efficient connection management with bb8
//! - **Lease Commands**: `SET NX PX`, `PTTL`, `TIME` and friends
//! - **Scripting**: Lua `EVAL` for atomic compare-and-act operations
//! - **Collections**: sorted-set and hash helpers used for membership and task registries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keystone_redis::{RedisConfig, RedisService};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379")
//!         .pool_size(10)
//!         .build();
//!
//!     let redis = RedisService::new(config).await?;
//!
//!     // Take a lease for 30 seconds if nobody else holds it
//!     let acquired = redis
//!         .set_nx_px("jobs:leader", b"token", Duration::from_secs(30))
//!         .await?;
//!     println!("acquired: {}", acquired);
//!
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use service::RedisService;

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
///
/// ```
/// use keystone_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::service::RedisService;
}
