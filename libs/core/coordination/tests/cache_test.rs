//! Cache behaviour across backend outages and concurrent misses

mod common;

use common::FlakyStore;
use coordination::cache::ENTRY_PREFIX;
use coordination::{
    CacheConfig, CacheError, CacheLayer, CoordinationError, DistributedLock, KeyValueStore,
    LockError, LockOptions, LockPolicy,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> CacheConfig {
    CacheConfig {
        probe_interval: Duration::from_secs(30),
        ..CacheConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_compute_once() {
    let store = FlakyStore::new();
    let cache = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    let computed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let computed = computed.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute("embedding:abc", Duration::from_secs(3600), || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, CacheError>(vec![0.25f32, 0.5, 0.75])
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|v| v == &vec![0.25f32, 0.5, 0.75]));
    assert!(!cache.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn test_separate_layers_share_fill_lock_through_store() {
    // Two processes over one shared store
    let store = FlakyStore::new();
    let first = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    let second = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    let computed = Arc::new(AtomicUsize::new(0));

    let slow = {
        let computed = computed.clone();
        tokio::spawn(async move {
            first
                .get_or_compute("search:q", Duration::from_secs(60), || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, CacheError>("hits".to_string())
                })
                .await
        })
    };
    // Let the first layer take the fill lock and start computing
    tokio::time::sleep(Duration::from_millis(10)).await;

    let value = second
        .get_or_compute("search:q", Duration::from_secs(60), || async {
            computed.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CacheError>("other".to_string())
        })
        .await
        .unwrap();

    assert_eq!(value, "hits");
    assert_eq!(slow.await.unwrap().unwrap(), "hits");
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_compute_is_not_cached() {
    let cache = CacheLayer::in_process(config());

    let err = cache
        .get_or_compute("classification:x", Duration::from_secs(60), || async {
            Err::<String, _>(CoordinationError::operation("provider timeout"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Operation(_)));
    assert_eq!(cache.get("classification:x").await.unwrap(), None);

    // Lock was released, so the next caller computes right away
    let value = cache
        .get_or_compute("classification:x", Duration::from_secs(60), || async {
            Ok::<_, CoordinationError>("simple".to_string())
        })
        .await
        .unwrap();
    assert_eq!(value, "simple");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_at_startup_serves_from_fallback() {
    let store = FlakyStore::new();
    store.go_down();

    let cache = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    assert!(cache.is_degraded());

    cache.set("k", b"v", Duration::from_secs(60)).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(cache.backend_name().await, "memory");
}

#[tokio::test(start_paused = true)]
async fn test_outage_mid_flight_switches_without_error() {
    let store = FlakyStore::new();
    let cache = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    cache.set("before", b"1", Duration::from_secs(600)).await.unwrap();

    store.go_down();
    cache.set("during", b"2", Duration::from_secs(600)).await.unwrap();
    assert!(cache.is_degraded());
    assert_eq!(cache.get("during").await.unwrap(), Some(b"2".to_vec()));

    // No probes before the interval elapses
    let calls = store.calls();
    for _ in 0..5 {
        cache.get("during").await.unwrap();
    }
    assert_eq!(store.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_probe_interval() {
    let store = FlakyStore::new();
    store.go_down();
    let cache = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    cache.set("outage", b"local", Duration::from_secs(600)).await.unwrap();

    store.come_back();
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(cache.get("outage").await.unwrap().is_some());
    assert!(cache.is_degraded());

    tokio::time::advance(Duration::from_secs(25)).await;
    cache.set("after", b"shared", Duration::from_secs(600)).await.unwrap();
    assert!(!cache.is_degraded());
    assert_eq!(cache.backend_name().await, "flaky");

    // Fallback entries stay behind
    assert_eq!(cache.get("outage").await.unwrap(), None);
    assert_eq!(
        store.get(&format!("{ENTRY_PREFIX}after")).await.unwrap(),
        Some(b"shared".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn test_clear_leaves_locks_on_shared_store() {
    let store = FlakyStore::new();
    let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());
    let cache = CacheLayer::connect(shared.clone(), config()).await;
    let locks = DistributedLock::new(shared.clone());

    let held = locks
        .acquire("upsert_batch:b1", LockOptions::non_blocking(Duration::from_secs(300)))
        .await
        .unwrap();
    assert_eq!(cache.size().await.unwrap(), 0);

    cache.set("search:q", b"hits", Duration::from_secs(60)).await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 1);
    cache.clear().await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 0);
    assert_eq!(cache.get("search:q").await.unwrap(), None);

    let second = locks
        .acquire("upsert_batch:b1", LockOptions::non_blocking(Duration::from_secs(300)))
        .await;
    assert!(matches!(second, Err(LockError::Timeout { .. })));
    assert!(locks.release(held).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_fill_lock_is_renewed_through_long_compute() {
    let store = FlakyStore::new();
    let cache = CacheLayer::connect(
        Arc::new(store.clone()),
        CacheConfig {
            fill_lock: LockPolicy::new(Duration::from_secs(1), Duration::from_secs(10)),
            ..config()
        },
    )
    .await;
    let computed = Arc::new(AtomicUsize::new(0));

    let slow = {
        let cache = cache.clone();
        let computed = computed.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("embedding:long", Duration::from_secs(600), || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(4)).await;
                    Ok::<_, CacheError>(vec![1.0f32])
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Outlives the 1s lock TTL several times over
    let value = cache
        .get_or_compute("embedding:long", Duration::from_secs(600), || async {
            computed.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CacheError>(vec![2.0f32])
        })
        .await
        .unwrap();

    assert_eq!(value, vec![1.0f32]);
    assert_eq!(slow.await.unwrap().unwrap(), vec![1.0f32]);
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_compute_under_fallback_still_deduplicates_in_process() {
    let store = FlakyStore::new();
    store.go_down();
    let cache = CacheLayer::connect(Arc::new(store.clone()), config()).await;
    let computed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let computed = computed.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute("vector_search:z", Duration::from_secs(60), || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, CacheError>(42u32)
                })
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 42);
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}
