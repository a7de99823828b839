use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cache_adapter::EmplaceOutcome;

use crate::{QueryResult, query_cache, setup};

const THREADS: usize = 8;

#[test]
fn test_single_responsible_among_threads() {
    setup();
    let cache = query_cache(100);
    let constructed = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);
    let (cache, constructed, barrier) = (&cache, &constructed, &barrier);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(move || {
                    let emplaced = cache.emplace("q1".into(), || {
                        constructed.fetch_add(1, Ordering::Relaxed);
                        QueryResult {
                            rows: vec![1, 2],
                            size: 0,
                        }
                    });
                    let outcome = emplaced.outcome();
                    // everyone has classified its request before anything is committed
                    barrier.wait();

                    let (responsibility, value) = emplaced.into_parts();
                    if let Some(responsibility) = responsibility {
                        responsibility.finish().unwrap();
                    }
                    (outcome, value.wait().unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let responsible = results
        .iter()
        .filter(|(outcome, _)| *outcome == EmplaceOutcome::Responsible)
        .count();
    let joined = results
        .iter()
        .filter(|(outcome, _)| *outcome == EmplaceOutcome::Joined)
        .count();
    assert_eq!(responsible, 1);
    assert_eq!(joined, THREADS - 1);
    assert_eq!(constructed.load(Ordering::Relaxed), 1);

    let (_, first) = &results[0];
    assert_eq!(first.size, 2);
    for (_, value) in &results {
        assert!(Arc::ptr_eq(first, value));
    }
    assert_eq!(cache.in_progress_len(), 0);
}

#[test]
fn test_each_key_computed_once() {
    setup();
    const KEYS: u64 = 64;
    let cache = query_cache(1_000);
    let constructed = AtomicUsize::new(0);
    let (cache, constructed) = (&cache, &constructed);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(move || {
                for key in 0..KEYS {
                    let (responsibility, value) = cache
                        .emplace(key.to_string(), || {
                            constructed.fetch_add(1, Ordering::Relaxed);
                            QueryResult::default()
                        })
                        .into_parts();
                    if let Some(mut responsibility) = responsibility {
                        responsibility.rows.push(key);
                        responsibility.finish().unwrap();
                    }
                    assert_eq!(value.wait().unwrap().rows, vec![key]);
                }
            });
        }
    });

    assert_eq!(constructed.load(Ordering::Relaxed), KEYS as usize);
    assert_eq!(cache.in_progress_len(), 0);
}

#[test]
fn test_waiters_released_by_commit_on_other_thread() {
    setup();
    let cache = query_cache(100);

    let responsible = cache.emplace("slow".into(), QueryResult::default);
    let joined = cache.emplace("slow".into(), QueryResult::default);
    assert_eq!(joined.outcome(), EmplaceOutcome::Joined);

    thread::scope(|s| {
        let waiter = s.spawn(|| joined.value().wait());
        s.spawn(move || {
            let (responsibility, _) = responsible.into_parts();
            let mut responsibility = responsibility.unwrap();
            thread::sleep(Duration::from_millis(20));
            responsibility.rows.push(7);
            responsibility.finish().unwrap();
        });

        let value = waiter.join().unwrap().unwrap();
        assert_eq!(
            *value,
            QueryResult {
                rows: vec![7],
                size: 1,
            }
        );
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_await_in_flight_value() {
    setup();
    let cache = query_cache(100);

    let responsible = cache.emplace("q1".into(), QueryResult::default);
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let joined = cache.emplace("q1".into(), QueryResult::default);
            assert_eq!(joined.outcome(), EmplaceOutcome::Joined);
            let (_, value) = joined.into_parts();
            tokio::spawn(value.into_future())
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let (responsibility, _) = responsible.into_parts();
    let mut responsibility = responsibility.unwrap();
    responsibility.rows.extend([3, 4, 5]);
    let committed = responsibility.finish().unwrap();

    for waiter in waiters {
        let value = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&value, &committed));
        assert_eq!(value.size, 3);
    }
}
