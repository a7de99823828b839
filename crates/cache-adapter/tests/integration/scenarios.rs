use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cache_adapter::config::CacheConfig;
use cache_adapter::{
    Abandoned, BackingCache, CacheAdapter, CommitError, EmplaceOutcome, MemoryCache, PinError,
};

use crate::{QueryResult, query_cache, setup};

#[test]
fn test_compute_join_commit_hit() {
    setup();
    let cache = query_cache(100);

    // T1 becomes responsible
    let mut t1 = cache.emplace("q1".into(), QueryResult::default);
    assert_eq!(t1.outcome(), EmplaceOutcome::Responsible);

    // T2 arrives before T1 commits and shares its computation
    let t2 = cache.emplace("q1".into(), || QueryResult {
        rows: vec![99],
        size: 0,
    });
    assert_eq!(t2.outcome(), EmplaceOutcome::Joined);
    assert!(t2.value().ptr_eq(t1.value()));
    assert!(!t2.value().is_ready());

    t1.responsibility_mut().unwrap().rows.extend([1, 2, 3]);
    let committed = t1.finish().unwrap().unwrap();
    assert_eq!(
        *committed,
        QueryResult {
            rows: vec![1, 2, 3],
            size: 3,
        }
    );

    // T2's handle now resolves to the committed value
    assert!(Arc::ptr_eq(&t2.value().get().unwrap(), &committed));

    // T3 observes the committed value, its arguments are ignored
    let t3 = cache.emplace("q1".into(), || unreachable!());
    assert_eq!(t3.outcome(), EmplaceOutcome::Hit);
    assert!(!t3.is_responsible());
    assert!(Arc::ptr_eq(&t3.value().get().unwrap(), &committed));
    assert_eq!(cache.in_progress_len(), 0);
}

#[test]
fn test_pinned_join_without_pinned_storage() {
    setup();
    let cache = CacheAdapter::new("queries", MemoryCache::new(100).with_pinning(false));

    let t1 = cache.emplace("k".to_owned(), || 1u32);
    assert_eq!(cache.is_pinned_in_progress(&"k".to_owned()), Some(false));

    let t2 = cache.emplace_pinned("k".to_owned(), || 2u32);
    assert_eq!(t2.outcome(), EmplaceOutcome::Joined);
    assert_eq!(cache.is_pinned_in_progress(&"k".to_owned()), Some(true));

    let err = t1.finish().unwrap_err();
    assert_eq!(
        err,
        CommitError::PinnedInsert {
            key: r#""k""#.into(),
            source: PinError::Unsupported,
        }
    );

    // nothing was committed, and the key is free to be computed again
    assert_eq!(t2.value().wait(), Err(Abandoned));
    assert!(!cache.is_in_progress(&"k".to_owned()));
    assert!(!cache.with_cache(|c| c.contains(&"k".to_owned())));
    assert_eq!(
        cache.emplace("k".to_owned(), || 3u32).outcome(),
        EmplaceOutcome::Responsible
    );
}

#[test]
fn test_commit_then_hit_ignores_constructor() {
    setup();
    let cache = query_cache(100);
    let constructed = AtomicUsize::new(0);
    let init = || {
        constructed.fetch_add(1, Ordering::Relaxed);
        QueryResult::default()
    };

    cache.emplace("q1".into(), init).finish().unwrap();
    for _ in 0..10 {
        let hit = cache.emplace("q1".into(), init);
        assert_eq!(hit.outcome(), EmplaceOutcome::Hit);
        assert_eq!(hit.finish(), Ok(None));
    }

    assert_eq!(constructed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_failed_construction_is_retryable() {
    setup();
    let cache = query_cache(100);

    let failed = cache.try_emplace("q1".into(), || Err("allocation limit"));
    assert!(matches!(failed, Err("allocation limit")));
    assert!(!cache.is_in_progress(&"q1".to_owned()));

    let retried = cache
        .try_emplace("q1".into(), || Ok::<_, &str>(QueryResult::default()))
        .unwrap();
    assert!(retried.is_responsible());
}

#[test]
fn test_forgotten_finish_is_rolled_back() {
    setup();
    let cache = query_cache(100);

    fn compute(cache: &crate::QueryCache) -> Result<(), &'static str> {
        let mut emplaced = cache.emplace("q1".into(), QueryResult::default);
        if let Some(result) = emplaced.responsibility_mut() {
            result.rows.push(1);
            // bails out before `finish`
            return Err("query failed");
        }
        Ok(())
    }

    let waiter = {
        let first = cache.emplace("q0".into(), QueryResult::default);
        first.value().clone()
    };
    assert!(waiter.is_abandoned());

    assert_eq!(compute(&cache), Err("query failed"));
    assert_eq!(cache.in_progress_len(), 0);
    assert!(cache.emplace("q1".into(), QueryResult::default).is_responsible());
}

#[test]
fn test_from_config() {
    setup();
    let config = CacheConfig {
        name: "configured".into(),
        max_capacity: 10,
        pinning: false,
        ..Default::default()
    };
    let cache = CacheAdapter::<u64, String>::from_config(&config);
    assert_eq!(cache.name(), "configured");

    let emplaced = cache.emplace_pinned(1, || "one".into());
    assert!(matches!(
        emplaced.finish(),
        Err(CommitError::PinnedInsert {
            source: PinError::Unsupported,
            ..
        })
    ));
}
