//! Request deduplication in front of an eviction-policy cache.
//!
//! A [`CacheAdapter`] ensures that among many concurrent callers asking for the same key,
//! exactly one computes the value, all others share that single in-flight computation, and
//! the finished value is committed into the [`BackingCache`] exactly once.
//!
//! ```
//! use cache_adapter::{CacheAdapter, EmplaceOutcome, MemoryCache};
//!
//! let adapter = CacheAdapter::new("queries", MemoryCache::new(1_000));
//!
//! let mut first = adapter.emplace("q1", Vec::new);
//! assert_eq!(first.outcome(), EmplaceOutcome::Responsible);
//!
//! // a concurrent request joins the computation in flight
//! let second = adapter.emplace("q1", || vec![0]);
//! assert_eq!(second.outcome(), EmplaceOutcome::Joined);
//! assert!(!second.value().is_ready());
//!
//! first.responsibility_mut().unwrap().push(42);
//! let committed = first.finish().unwrap().unwrap();
//!
//! assert_eq!(*second.value().wait().unwrap(), vec![42]);
//! assert_eq!(*committed, vec![42]);
//! ```

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod adapter;
mod backing;
pub mod config;
mod value;

pub use adapter::*;
pub use backing::*;
pub use value::*;
