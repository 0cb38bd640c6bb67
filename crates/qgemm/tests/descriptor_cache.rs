use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use qgemm::qgemm::{CachePolicy, DescriptorCache, GemmPlan, ShapeKey};
use qgemm::{BackendError, DevicePtr};

fn key(m: usize, k: usize, n: usize) -> ShapeKey {
    ShapeKey {
        m,
        k,
        n,
        lda: k,
        ldb: k,
        ldc: m,
        transpose_a: true,
        transpose_b: false,
        bias: DevicePtr(0x1000),
    }
}

#[test]
fn repeated_key_returns_the_same_bundle() {
    let cache = DescriptorCache::<GemmPlan>::new(CachePolicy::Unbounded);
    let built = AtomicUsize::new(0);
    let create = |key: &ShapeKey| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(GemmPlan::from_key(key))
    };

    let first = cache.get_or_create(key(128, 64, 32), create).unwrap();
    let second = cache.get_or_create(key(128, 64, 32), create).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(built.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
}

#[test]
fn distinct_fields_build_distinct_bundles() {
    let cache = DescriptorCache::<GemmPlan>::new(CachePolicy::Unbounded);
    let base = key(16, 8, 4);
    let mut other_bias = base;
    other_bias.bias = DevicePtr(0x2000);
    let mut other_transpose = base;
    other_transpose.transpose_b = true;

    let a = cache
        .get_or_create(base, |key| Ok(GemmPlan::from_key(key)))
        .unwrap();
    let b = cache
        .get_or_create(other_bias, |key| Ok(GemmPlan::from_key(key)))
        .unwrap();
    let c = cache
        .get_or_create(other_transpose, |key| Ok(GemmPlan::from_key(key)))
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(cache.stats().entries, 3);
}

#[test]
fn concurrent_first_use_builds_once() {
    const THREADS: usize = 8;
    let cache = DescriptorCache::<GemmPlan>::new(CachePolicy::Unbounded);
    let built = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    let bundles: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache
                        .get_or_create(key(64, 32, 16), |key| {
                            built.fetch_add(1, Ordering::SeqCst);
                            Ok(GemmPlan::from_key(key))
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(built.load(Ordering::SeqCst), 1);
    for bundle in &bundles[1..] {
        assert!(Arc::ptr_eq(&bundles[0], bundle));
    }
    let stats = cache.stats();
    assert_eq!(stats.hits, (THREADS - 1) as u64);
    assert_eq!(stats.misses, 1);
}

#[test]
fn failed_construction_is_not_cached() {
    let cache = DescriptorCache::<GemmPlan>::new(CachePolicy::Unbounded);
    let err = cache
        .get_or_create(key(4, 4, 4), |_| {
            Err(BackendError::BackendCall {
                call: "cublasLtMatmulDescCreate",
                status: 3,
            })
        })
        .unwrap_err();
    assert!(matches!(err, BackendError::BackendCall { status: 3, .. }));
    assert_eq!(cache.stats().entries, 0);

    let retried = cache
        .get_or_create(key(4, 4, 4), |key| Ok(GemmPlan::from_key(key)))
        .unwrap();
    assert_eq!(retried.k, 4);
    assert_eq!(cache.stats().entries, 1);
}

#[test]
fn lru_policy_evicts_least_recently_used() {
    let capacity = NonZeroUsize::new(2).unwrap();
    let cache = DescriptorCache::<GemmPlan>::new(CachePolicy::Lru { capacity });
    let built = AtomicUsize::new(0);
    let create = |key: &ShapeKey| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(GemmPlan::from_key(key))
    };

    cache.get_or_create(key(1, 1, 1), create).unwrap();
    cache.get_or_create(key(2, 2, 2), create).unwrap();
    // Touch the first key so the second becomes the eviction candidate.
    cache.get_or_create(key(1, 1, 1), create).unwrap();
    cache.get_or_create(key(3, 3, 3), create).unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 3);

    cache.get_or_create(key(1, 1, 1), create).unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 3);
    cache.get_or_create(key(2, 2, 2), create).unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 4);

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.evictions, 2);
}
