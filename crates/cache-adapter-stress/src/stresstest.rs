use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use cache_adapter::config::CacheConfig;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Adapter, PreparedWorkload, WorkloadsConfig, process_request};

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let adapter = Arc::new(Adapter::from_config(&cache_config));

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(PreparedWorkload::new(i, workload)))
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let adapter = Arc::clone(&adapter);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let adapter = Arc::clone(&adapter);
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            process_request(&adapter, &workload).await;

                            if let Ok(mut task_durations) = task_durations.lock() {
                                task_durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };
            task_durations
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (workload, task) in workloads.iter().zip(finished_tasks) {
        let task_durations = task?;
        let i = workload.index;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if let Some(sum) = task_durations.sum() {
            let quantile = |q| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = Duration::from_secs_f64(sum / ops as f64);
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let outcomes = &workload.outcomes;
        let hits = outcomes.hits.load(Ordering::Relaxed);
        let joined = outcomes.joined.load(Ordering::Relaxed);
        let computed = outcomes.computed.load(Ordering::Relaxed);
        let failed = outcomes.failed.load(Ordering::Relaxed);
        println!("  hits: {hits}; joined: {joined}; computed: {computed}; failed: {failed}");
    }

    let in_progress = adapter.in_progress_len();
    if in_progress > 0 {
        tracing::warn!(in_progress, "Computations still in progress after the stresstest");
    }

    Ok(())
}
