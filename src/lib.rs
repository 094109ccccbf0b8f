// Keystone - distributed coordination on a Redis lease store
//
// This library provides renewable distributed locks, lease-backed task
// contexts and a cluster monitor that re-enters tasks of crashed nodes.

// Re-export member crates
pub use keystone_distributed;
pub use keystone_redis;

// Re-export coordination primitives
pub use keystone_distributed::*;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        CallOptions,
        ClusterMonitor,
        DistributedLock,
        LeaseStore,
        LockBuilder,
        LockConfig,
        MemoryStore,
        MonitorConfig,
        RedisStore,
        TaskContext,
    };

    pub use keystone_redis::RedisConfig;
}
