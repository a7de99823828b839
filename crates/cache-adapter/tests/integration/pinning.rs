use cache_adapter::{BackingCache, EmplaceOutcome};

use crate::{QueryResult, query_cache, setup};

#[test]
fn test_pinned_commit() {
    setup();
    let cache = query_cache(100);

    let emplaced = cache.emplace_pinned("q1".into(), QueryResult::default);
    assert_eq!(cache.is_pinned_in_progress(&"q1".to_owned()), Some(true));
    emplaced.finish().unwrap();

    cache.with_cache(|c| {
        assert!(c.is_pinned(&"q1".to_owned()));
        assert_eq!(c.pinned_count(), 1);
    });
}

#[test]
fn test_joined_pinned_request_pins_commit() {
    setup();
    let cache = query_cache(100);

    let first = cache.emplace("q1".into(), QueryResult::default);
    let joined = cache.emplace_pinned("q1".into(), QueryResult::default);
    assert_eq!(joined.outcome(), EmplaceOutcome::Joined);

    // a later unpinned request does not downgrade the entry
    let _again = cache.emplace("q1".into(), QueryResult::default);
    first.finish().unwrap();

    assert!(joined.value().is_ready());
    assert!(cache.with_cache(|c| c.is_pinned(&"q1".to_owned())));
}

#[test]
fn test_pinned_hit_upgrades_committed_entry() {
    setup();
    let cache = query_cache(100);

    cache.emplace("q1".into(), QueryResult::default).finish().unwrap();
    assert!(!cache.with_cache(|c| c.is_pinned(&"q1".to_owned())));

    let hit = cache.emplace_pinned("q1".into(), || unreachable!());
    assert_eq!(hit.outcome(), EmplaceOutcome::Hit);
    assert!(cache.with_cache(|c| c.is_pinned(&"q1".to_owned())));
}

#[test]
fn test_pinned_entries_survive_eviction() {
    setup();
    let cache = query_cache(4);

    cache
        .emplace_pinned("pinned".into(), || QueryResult {
            rows: vec![1],
            size: 0,
        })
        .finish()
        .unwrap();
    for i in 0..100 {
        cache.emplace(format!("q{i}"), QueryResult::default).finish().unwrap();
    }

    cache.with_cache(|c| {
        c.run_pending_tasks();
        assert!(c.unpinned_count() <= 4);
        assert!(c.contains(&"pinned".to_owned()));
    });

    let hit = cache.emplace("pinned".into(), || unreachable!());
    assert_eq!(hit.outcome(), EmplaceOutcome::Hit);
    assert_eq!(hit.value().get().unwrap().size, 1);
}
