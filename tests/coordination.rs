//! Integration tests for cross-node coordination.
//!
//! Every "node" here is a separate lock or monitor instance sharing one
//! store, which is how separate processes share a Redis server.

use keystone::prelude::*;
use keystone::{MonitorError, spawn_supervised};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_monitor(store: &Arc<MemoryStore>) -> ClusterMonitor {
    ClusterMonitor::builder(store.clone())
        .heartbeat_interval(Duration::from_millis(100))
        .heartbeat_timeout(Duration::from_millis(300))
        .watch_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

// =============================================================================
// Lock Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_lock_handoff_between_nodes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let build = || {
        LockBuilder::new()
            .lease_duration(Duration::from_millis(300))
            .renew_interval(Duration::from_millis(100))
            .build(store.clone())
            .unwrap()
    };
    let a = build();
    let b = build();

    assert!(a.acquire("invoices").await.unwrap());
    assert!(!b.acquire("invoices").await.unwrap());

    // Renewal keeps `b` out well past the lease duration
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!b.acquire("invoices").await.unwrap());

    a.release().await.unwrap();
    assert!(b.acquire("invoices").await.unwrap());
    assert_eq!(b.check("invoices").await.unwrap(), (true, true));
    assert_eq!(a.check("invoices").await.unwrap(), (false, false));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_lockers_serialize() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..5)
        .map(|_| {
            let store = store.clone();
            let inside = inside.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                let lock = LockBuilder::new()
                    .lease_duration(Duration::from_millis(300))
                    .renew_interval(Duration::from_millis(100))
                    .build(store)
                    .unwrap();
                while !lock.acquire("ledger").await.unwrap() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(150)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.release().await.unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for result in futures::future::join_all(workers).await {
        result.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 5);
}

// =============================================================================
// Monitor Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_leader_failover_reenters_its_tasks() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = fast_monitor(&store);
    first.register("reindex", |_ctx| async {});
    first.start("search");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(first.is_master());

    let second = fast_monitor(&store);
    second.register("reindex", move |ctx: TaskContext| {
        let tx = tx.clone();
        async move {
            let checkpoint = ctx.get().await.unwrap();
            tx.send((ctx.key().to_string(), checkpoint)).unwrap();
        }
    });
    second.start("search");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_master());

    let ctx = first.watch("reindex", "products", None).await.unwrap();
    ctx.set(b"shard=3").await.unwrap();

    // The leader dies with the task in flight
    let lease = store.get("search").await.unwrap();
    drop(first);

    // Its lease outlives it until the heartbeat timeout
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get("search").await.unwrap(), lease);
    assert!(!second.is_master());
    assert!(rx.try_recv().is_err());

    let (key, checkpoint) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "search|reindex|products");
    assert_eq!(checkpoint, b"shard=3".to_vec());
    assert!(second.is_master());
    assert_ne!(store.get("search").await.unwrap(), lease);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(second.watch_list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_never_reenters() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let leader = fast_monitor(&store);
    let seen = calls.clone();
    leader.register("reindex", move |_ctx| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    leader.start("search");

    let worker = fast_monitor(&store);
    worker.register("reindex", |_ctx| async {});
    worker.start("search");
    tokio::time::sleep(Duration::from_millis(50)).await;

    for tag in ["a", "b", "c"] {
        worker.watch("reindex", tag, Some(tag.as_bytes())).await.unwrap();
    }
    assert_eq!(
        leader.watch_list().await.unwrap(),
        vec!["search|reindex|a", "search|reindex|b", "search|reindex|c"]
    );

    for tag in ["a", "b", "c"] {
        worker.unwatch("reindex", tag).await.unwrap();
    }
    worker.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(leader.watch_list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_does_not_split_leadership() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let monitors: Vec<_> = (0..3).map(|_| fast_monitor(&store)).collect();
    for m in &monitors {
        m.start("search");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitors.iter().filter(|m| m.is_master()).count(), 1);

    // Shorter than the heartbeat timeout
    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(120)).await;
    store.set_available(true);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitors.iter().filter(|m| m.is_master()).count(), 1);
}

#[tokio::test]
async fn test_watch_requires_start() {
    let store = Arc::new(MemoryStore::new());
    let monitor = fast_monitor(&store);
    monitor.register("reindex", |_ctx| async {});

    let err = monitor.watch("reindex", "x", None).await.unwrap_err();
    assert!(matches!(err, MonitorError::NotStarted));
}

#[tokio::test]
async fn test_supervised_panic_does_not_escape() {
    let handle = spawn_supervised("integration", async {
        panic!("task failed");
    });
    assert!(handle.await.is_ok());
}

// =============================================================================
// Redis Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_lock_and_monitor() {
    init_tracing();
    let store = Arc::new(RedisStore::connect(RedisConfig::from_env().build()).await.unwrap());

    let lock = LockBuilder::new().build(store.clone()).unwrap();
    let key = format!("keystone-test-{}", std::process::id());
    assert!(lock.acquire(&key).await.unwrap());
    assert_eq!(lock.check(&key).await.unwrap(), (true, true));
    lock.release().await.unwrap();

    let monitor = ClusterMonitor::builder(store)
        .heartbeat_interval(Duration::from_millis(200))
        .heartbeat_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    monitor.register("reindex", |_ctx| async {});
    monitor.start(format!("{}-group", key));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(monitor.is_master());

    let ctx = monitor.watch("reindex", "1", Some(b"x")).await.unwrap();
    assert_eq!(ctx.get().await.unwrap(), b"x".to_vec());
    monitor.unwatch("reindex", "1").await.unwrap();
    monitor.stop().await.unwrap();
}
