use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use cache_adapter::{CacheAdapter, EmplaceOutcome};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys this workload cycles through.
    pub keys: u64,
    /// How long the responsible request takes to compute a value.
    #[serde(with = "humantime_serde")]
    pub compute_time: Duration,
    /// Whether values are requested as pinned.
    #[serde(default)]
    pub pinned: bool,
}

/// The value computed for every key.
#[derive(Debug)]
pub struct Computed {
    pub workload: usize,
    pub key: u64,
}

pub type Adapter = CacheAdapter<String, Computed>;

/// A workload ready to be run against a shared adapter.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub index: usize,
    pub concurrency: usize,
    keys: u64,
    compute_time: Duration,
    pinned: bool,
    next_key: AtomicU64,
    pub outcomes: Outcomes,
}

impl PreparedWorkload {
    pub fn new(index: usize, workload: Workload) -> Self {
        Self {
            index,
            concurrency: workload.concurrency,
            keys: workload.keys.max(1),
            compute_time: workload.compute_time,
            pinned: workload.pinned,
            next_key: AtomicU64::new(0),
            outcomes: Outcomes::default(),
        }
    }

    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed) % self.keys
    }
}

/// Counts how requests were classified by the adapter.
#[derive(Debug, Default)]
pub struct Outcomes {
    pub hits: AtomicUsize,
    pub joined: AtomicUsize,
    pub computed: AtomicUsize,
    pub failed: AtomicUsize,
}

impl Outcomes {
    fn record(&self, outcome: EmplaceOutcome) {
        let counter = match outcome {
            EmplaceOutcome::Hit => &self.hits,
            EmplaceOutcome::Joined => &self.joined,
            EmplaceOutcome::Responsible => &self.computed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Requests the next key of `workload`, computing it if this request is responsible.
pub async fn process_request(adapter: &Adapter, workload: &PreparedWorkload) {
    let key = workload.next_key();
    let cache_key = format!("{}:{key}", workload.index);
    let init = || Computed {
        workload: workload.index,
        key,
    };

    let emplaced = if workload.pinned {
        adapter.emplace_pinned(cache_key, init)
    } else {
        adapter.emplace(cache_key, init)
    };
    workload.outcomes.record(emplaced.outcome());

    match emplaced.into_parts() {
        (Some(responsibility), _) => {
            tokio::time::sleep(workload.compute_time).await;
            if let Err(error) = responsibility.finish() {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    workload = workload.index,
                    key,
                    "Failed to commit value",
                );
                workload.outcomes.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        (None, value) => match value.await {
            Ok(computed) if computed.workload == workload.index && computed.key == key => {}
            Ok(computed) => {
                tracing::error!(workload = workload.index, key, ?computed, "Received wrong value");
                workload.outcomes.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    workload = workload.index,
                    key,
                    "Joined computation was abandoned",
                );
                workload.outcomes.failed.fetch_add(1, Ordering::Relaxed);
            }
        },
    }
}
