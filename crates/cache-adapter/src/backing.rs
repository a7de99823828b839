use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::config::CacheConfig;

/// An error returned by [`BackingCache::insert_pinned`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    /// The backing cache has no storage for pinned entries.
    #[error("the backing cache does not support pinned entries")]
    Unsupported,
}

/// The eviction-policy cache that holds committed values.
///
/// The [`CacheAdapter`](crate::CacheAdapter) only ever accesses the backing cache while holding
/// its exclusive lock, so implementations do not need to synchronize internally.
pub trait BackingCache<K, V>: Send + 'static {
    /// Whether a committed value exists for `key`.
    fn contains(&self, key: &K) -> bool;

    /// Whether a committed value exists for `key` that is pinned or can be made pinned.
    ///
    /// Implementations are expected to upgrade an existing unpinned entry to pinned.
    fn contains_pinned_or_upgradeable(&mut self, key: &K) -> bool;

    /// Returns the committed value for `key`.
    fn lookup(&self, key: &K) -> Option<Arc<V>>;

    /// Inserts a committed value that is subject to the eviction policy.
    fn insert(&mut self, key: K, value: Arc<V>);

    /// Inserts a committed value that must not be evicted.
    fn insert_pinned(&mut self, key: K, value: Arc<V>) -> Result<(), PinError>;
}

/// An in-memory [`BackingCache`].
///
/// Unpinned entries live in a [`moka`] cache bounded by `max_capacity` entries and are evicted
/// according to its policy. Pinned entries are kept aside and are never evicted.
pub struct MemoryCache<K, V> {
    unpinned: moka::sync::Cache<K, Arc<V>>,
    pinned: FxHashMap<K, Arc<V>>,
    pinning: bool,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_capacity` unpinned entries.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            unpinned: moka::sync::Cache::new(max_capacity),
            pinned: FxHashMap::default(),
            pinning: true,
        }
    }

    /// Creates a cache according to the given configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .name(&config.name)
            .max_capacity(config.max_capacity);
        if let Some(time_to_idle) = config.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            unpinned: builder.build(),
            pinned: FxHashMap::default(),
            pinning: config.pinning,
        }
    }

    /// Enables or disables pinned storage.
    ///
    /// Without it, [`insert_pinned`](BackingCache::insert_pinned) fails with
    /// [`PinError::Unsupported`] and unpinned entries are not upgraded.
    pub fn with_pinning(mut self, enabled: bool) -> Self {
        self.pinning = enabled;
        self
    }

    /// Whether `key` is held as a pinned entry.
    pub fn is_pinned(&self, key: &K) -> bool {
        self.pinned.contains_key(key)
    }

    /// The number of pinned entries.
    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    /// The approximate number of unpinned entries.
    ///
    /// This is only accurate after [`MemoryCache::run_pending_tasks`].
    pub fn unpinned_count(&self) -> u64 {
        self.unpinned.entry_count()
    }

    /// Applies pending evictions of unpinned entries.
    pub fn run_pending_tasks(&self) {
        self.unpinned.run_pending_tasks();
    }
}

impl<K, V> BackingCache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn contains(&self, key: &K) -> bool {
        self.pinned.contains_key(key) || self.unpinned.contains_key(key)
    }

    fn contains_pinned_or_upgradeable(&mut self, key: &K) -> bool {
        if self.pinned.contains_key(key) {
            return true;
        }
        if !self.pinning {
            return self.unpinned.contains_key(key);
        }

        match self.unpinned.remove(key) {
            Some(value) => {
                tracing::trace!("Upgrading cached entry to pinned");
                self.pinned.insert(key.clone(), value);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        match self.pinned.get(key) {
            Some(value) => Some(Arc::clone(value)),
            None => self.unpinned.get(key),
        }
    }

    fn insert(&mut self, key: K, value: Arc<V>) {
        if self.pinned.contains_key(&key) {
            // a pinned entry is never demoted by a later unpinned commit
            self.pinned.insert(key, value);
        } else {
            self.unpinned.insert(key, value);
        }
    }

    fn insert_pinned(&mut self, key: K, value: Arc<V>) -> Result<(), PinError> {
        if !self.pinning {
            return Err(PinError::Unsupported);
        }
        self.unpinned.invalidate(&key);
        self.pinned.insert(key, value);
        Ok(())
    }
}

impl<K, V> fmt::Debug for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.unpinned.name())
            .field("unpinned", &self.unpinned.entry_count())
            .field("pinned", &self.pinned.len())
            .field("pinning", &self.pinning)
            .finish()
    }
}
