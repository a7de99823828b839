use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::backing::{BackingCache, MemoryCache, PinError};
use crate::config::CacheConfig;
use crate::value::{ReadySender, SharedValue};

/// An error committing a computed value into the [`BackingCache`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    /// The entry was requested as pinned, but the backing cache refused the pinned insert.
    ///
    /// The in-progress entry is erased regardless, so the key can be computed again.
    #[error("failed to commit pinned entry for key {key}")]
    PinnedInsert {
        /// The `Debug` representation of the key.
        key: String,
        /// The reason reported by the backing cache.
        #[source]
        source: PinError,
    },
}

/// How a request to [`CacheAdapter::try_emplace`] was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmplaceOutcome {
    /// The value was already committed to the backing cache.
    Hit,
    /// The value is currently being computed by another caller.
    Joined,
    /// The caller has to compute the value and commit it.
    Responsible,
}

impl EmplaceOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Joined => "joined",
            Self::Responsible => "responsible",
        }
    }
}

type PostProcess<V> = Box<dyn Fn(&mut V) + Send + Sync>;

/// A value that is currently being computed.
struct InProgress<V> {
    /// Whether the value will be inserted as pinned once committed.
    pinned: bool,
    value: SharedValue<V>,
}

/// All mutable state of one adapter, only reachable through [`Inner::with_state`].
struct State<K, V, C> {
    cache: C,
    in_progress: FxHashMap<K, InProgress<V>>,
}

struct Inner<K, V, C> {
    name: String,
    state: Mutex<State<K, V, C>>,
    /// Invoked exactly once on every value right before it is committed.
    post_process: PostProcess<V>,
}

impl<K, V, C> Inner<K, V, C> {
    /// Runs `f` with exclusive access to the cache state.
    ///
    /// This lock is not reentrant, `f` must not call back into the adapter.
    fn with_state<R>(&self, f: impl FnOnce(&mut State<K, V, C>) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }
}

/// Deduplicates concurrent computations of values in front of a [`BackingCache`].
///
/// For every key, exactly one caller of [`try_emplace`](Self::try_emplace) becomes
/// responsible for computing the value; concurrent callers for the same key get a
/// [`SharedValue`] observing that same computation instead. Once the responsible caller
/// [`finish`](Responsibility::finish)es, the value is committed into the backing cache and
/// all subsequent requests are served from there.
///
/// All transitions are serialized by a single lock per adapter, which is also held while
/// the value constructor and the post-process callback run. Both should be cheap.
pub struct CacheAdapter<K, V, C = MemoryCache<K, V>> {
    inner: Arc<Inner<K, V, C>>,
}

impl<K, V, C> Clone for CacheAdapter<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, C> fmt::Debug for CacheAdapter<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_progress = self
            .inner
            .state
            .try_lock()
            .map(|state| state.in_progress.len());
        f.debug_struct("CacheAdapter")
            .field("name", &self.inner.name)
            .field("in_progress", &in_progress)
            .finish()
    }
}

impl<K, V> CacheAdapter<K, V, MemoryCache<K, V>>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an adapter on a fresh [`MemoryCache`] built from `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.name.clone(), MemoryCache::from_config(config))
    }
}

impl<K, V, C> CacheAdapter<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    /// Creates an adapter that commits values into `cache` without post-processing.
    pub fn new(name: impl Into<String>, cache: C) -> Self {
        Self::with_post_process(name, cache, |_| {})
    }

    /// Creates an adapter that runs `post_process` on every value right before committing it.
    ///
    /// The callback runs while the adapter lock is held.
    pub fn with_post_process<F>(name: impl Into<String>, cache: C, post_process: F) -> Self
    where
        F: Fn(&mut V) + Send + Sync + 'static,
    {
        let state = State {
            cache,
            in_progress: FxHashMap::default(),
        };
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(state),
                post_process: Box::new(post_process),
            }),
        }
    }

    /// The name of this adapter, as used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Requests the value for `key`, constructing it with `init` if this caller becomes
    /// responsible for computing it.
    ///
    /// `init` is only called when the key is neither committed nor in progress. If it fails,
    /// its error is returned and the adapter state is left untouched.
    pub fn try_emplace<E, F>(&self, key: K, init: F) -> Result<TryEmplace<K, V, C>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.emplace_impl(key, false, init)
    }

    /// Like [`try_emplace`](Self::try_emplace), but requests the value to be pinned.
    ///
    /// If the key is already in progress, the in-progress entry is upgraded to pinned. A
    /// committed unpinned entry is upgraded by the backing cache, if it supports that.
    pub fn try_emplace_pinned<E, F>(&self, key: K, init: F) -> Result<TryEmplace<K, V, C>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.emplace_impl(key, true, init)
    }

    /// Infallible version of [`try_emplace`](Self::try_emplace).
    pub fn emplace<F>(&self, key: K, init: F) -> TryEmplace<K, V, C>
    where
        F: FnOnce() -> V,
    {
        match self.emplace_impl(key, false, || Ok::<_, Infallible>(init())) {
            Ok(emplaced) => emplaced,
            Err(never) => match never {},
        }
    }

    /// Infallible version of [`try_emplace_pinned`](Self::try_emplace_pinned).
    pub fn emplace_pinned<F>(&self, key: K, init: F) -> TryEmplace<K, V, C>
    where
        F: FnOnce() -> V,
    {
        match self.emplace_impl(key, true, || Ok::<_, Infallible>(init())) {
            Ok(emplaced) => emplaced,
            Err(never) => match never {},
        }
    }

    /// The number of keys currently being computed.
    pub fn in_progress_len(&self) -> usize {
        self.inner.with_state(|state| state.in_progress.len())
    }

    /// Whether `key` is currently being computed.
    pub fn is_in_progress(&self, key: &K) -> bool {
        self.inner
            .with_state(|state| state.in_progress.contains_key(key))
    }

    /// Whether the in-progress computation of `key` will be committed as pinned.
    ///
    /// Returns `None` if `key` is not in progress.
    pub fn is_pinned_in_progress(&self, key: &K) -> Option<bool> {
        self.inner
            .with_state(|state| state.in_progress.get(key).map(|entry| entry.pinned))
    }

    /// Runs `f` with exclusive access to the backing cache.
    ///
    /// The adapter lock is held while `f` runs.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        self.inner.with_state(|state| f(&mut state.cache))
    }

    fn emplace_impl<E, F>(&self, key: K, pinned: bool, init: F) -> Result<TryEmplace<K, V, C>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let name = self.name();

        // The responsibility is built after the lock is released: dropping it would re-lock.
        let (claim, in_progress) = self.inner.with_state(|state| -> Result<_, E> {
            let contained = if pinned {
                state.cache.contains_pinned_or_upgradeable(&key)
            } else {
                state.cache.contains(&key)
            };
            if contained {
                if let Some(value) = state.cache.lookup(&key) {
                    let claim = Claim::Hit(SharedValue::committed(value));
                    return Ok((claim, state.in_progress.len()));
                }
            }

            if let Some(entry) = state.in_progress.get_mut(&key) {
                entry.pinned |= pinned;
                let claim = Claim::Joined(entry.value.clone());
                return Ok((claim, state.in_progress.len()));
            }

            let value = init()?;
            let (notify, handle) = SharedValue::pending();
            state.in_progress.insert(
                key.clone(),
                InProgress {
                    pinned,
                    value: handle.clone(),
                },
            );
            let claim = Claim::Responsible(value, notify, handle);
            Ok((claim, state.in_progress.len()))
        })?;

        let outcome = claim.outcome();
        tracing::trace!(
            cache = name,
            ?key,
            pinned,
            outcome = outcome.as_str(),
            "Classified cache request"
        );
        metric!(
            counter("adapter.emplace") += 1,
            "cache" => name,
            "outcome" => outcome.as_str(),
        );
        metric!(gauge("adapter.in_progress") = in_progress as u64, "cache" => name);

        let emplaced = match claim {
            Claim::Hit(value) | Claim::Joined(value) => TryEmplace {
                outcome,
                responsibility: None,
                value,
            },
            Claim::Responsible(value, notify, handle) => TryEmplace {
                outcome,
                responsibility: Some(Responsibility {
                    value,
                    slot: Slot {
                        key,
                        notify: Some(notify),
                        inner: Arc::clone(&self.inner),
                        settled: false,
                    },
                }),
                value: handle,
            },
        };
        Ok(emplaced)
    }
}

enum Claim<V> {
    Hit(SharedValue<V>),
    Joined(SharedValue<V>),
    Responsible(V, ReadySender<V>, SharedValue<V>),
}

impl<V> Claim<V> {
    fn outcome(&self) -> EmplaceOutcome {
        match self {
            Self::Hit(_) => EmplaceOutcome::Hit,
            Self::Joined(_) => EmplaceOutcome::Joined,
            Self::Responsible(..) => EmplaceOutcome::Responsible,
        }
    }
}

/// The result of [`CacheAdapter::try_emplace`].
///
/// It always carries a [`SharedValue`] handle, and additionally a [`Responsibility`] if the
/// caller has to compute the value.
pub struct TryEmplace<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    outcome: EmplaceOutcome,
    responsibility: Option<Responsibility<K, V, C>>,
    value: SharedValue<V>,
}

impl<K, V, C> TryEmplace<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    /// How the request was classified.
    pub fn outcome(&self) -> EmplaceOutcome {
        self.outcome
    }

    /// Whether this caller has to compute and commit the value.
    pub fn is_responsible(&self) -> bool {
        self.responsibility.is_some()
    }

    /// The handle on the committed or in-flight value.
    pub fn value(&self) -> &SharedValue<V> {
        &self.value
    }

    /// Mutable access to the value under construction, if this caller is responsible.
    pub fn responsibility_mut(&mut self) -> Option<&mut Responsibility<K, V, C>> {
        self.responsibility.as_mut()
    }

    /// Splits this result into the optional responsibility and the value handle.
    pub fn into_parts(self) -> (Option<Responsibility<K, V, C>>, SharedValue<V>) {
        (self.responsibility, self.value)
    }

    /// Commits the value if this caller is responsible, see [`Responsibility::finish`].
    ///
    /// Without responsibility this does nothing and returns `Ok(None)`.
    pub fn finish(self) -> Result<Option<Arc<V>>, CommitError> {
        match self.responsibility {
            Some(responsibility) => responsibility.finish().map(Some),
            None => Ok(None),
        }
    }
}

impl<K, V, C> fmt::Debug for TryEmplace<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryEmplace")
            .field("outcome", &self.outcome)
            .field("responsibility", &self.responsibility)
            .field("value", &self.value)
            .finish()
    }
}

/// The obligation to compute a value and commit it.
///
/// Dereferences to the value under construction, which only the responsible caller can
/// mutate. Consuming it through [`finish`](Self::finish) commits the value; dropping it
/// without finishing rolls the computation back, as does [`abort`](Self::abort).
pub struct Responsibility<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    value: V,
    slot: Slot<K, V, C>,
}

impl<K, V, C> Responsibility<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    /// The key this caller is responsible for.
    pub fn key(&self) -> &K {
        &self.slot.key
    }

    /// Commits the value into the backing cache.
    ///
    /// Under the adapter lock, this runs the post-process callback, inserts the value
    /// (pinned, if any request for this key asked for it) and erases the in-progress entry.
    /// Afterwards, all [`SharedValue`] handles of this computation resolve to the value.
    ///
    /// # Errors
    ///
    /// If the entry is pinned and the backing cache refuses the pinned insert, this returns
    /// [`CommitError::PinnedInsert`]. The in-progress entry is erased nonetheless, and all
    /// waiting handles resolve as [`Abandoned`](crate::Abandoned).
    pub fn finish(self) -> Result<Arc<V>, CommitError> {
        let Self { value, mut slot } = self;
        slot.commit(value)
    }

    /// Rolls back the computation without committing anything.
    ///
    /// The key becomes absent again, so the next request for it becomes responsible.
    pub fn abort(self) {
        let Self { value, mut slot } = self;
        drop(value);
        slot.rollback();
    }
}

impl<K, V, C> Deref for Responsibility<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V, C> DerefMut for Responsibility<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    fn deref_mut(&mut self) -> &mut V {
        &mut self.value
    }
}

impl<K, V, C> fmt::Debug for Responsibility<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responsibility")
            .field("key", &self.slot.key)
            .field("value", &self.value)
            .finish()
    }
}

/// The registry side of a [`Responsibility`].
///
/// Unless it was settled by a commit or an explicit abort, dropping it rolls back the
/// in-progress entry, so an early return or panic of the responsible caller cannot leave the
/// key in progress forever.
struct Slot<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    key: K,
    notify: Option<ReadySender<V>>,
    inner: Arc<Inner<K, V, C>>,
    settled: bool,
}

impl<K, V, C> Slot<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    fn commit(&mut self, mut value: V) -> Result<Arc<V>, CommitError> {
        let inner = &*self.inner;
        let key = &self.key;

        let committed = inner.with_state(|state| {
            (inner.post_process)(&mut value);
            let value = Arc::new(value);

            let pinned = state
                .in_progress
                .get(key)
                .is_some_and(|entry| entry.pinned);
            let inserted = if pinned {
                state.cache.insert_pinned(key.clone(), Arc::clone(&value))
            } else {
                state.cache.insert(key.clone(), Arc::clone(&value));
                Ok(())
            };
            state.in_progress.remove(key);

            inserted.map(|()| (value, pinned))
        });
        // A panic in `post_process` unwinds past this point and leaves the slot unsettled,
        // so that `Drop` rolls the entry back.
        self.settled = true;

        let pinned_tag = |pinned: bool| if pinned { "true" } else { "false" };
        match committed {
            Ok((value, pinned)) => {
                tracing::debug!(cache = %inner.name, ?key, pinned, "Committed cache entry");
                metric!(
                    counter("adapter.commit") += 1,
                    "cache" => &inner.name,
                    "pinned" => pinned_tag(pinned),
                );
                if let Some(notify) = self.notify.take() {
                    // all handles may already be gone, which is fine
                    let _ = notify.send(Arc::clone(&value));
                }
                Ok(value)
            }
            Err(source) => {
                tracing::error!(
                    error = &source as &dyn std::error::Error,
                    cache = %inner.name,
                    ?key,
                    "Failed to commit pinned cache entry",
                );
                metric!(counter("adapter.commit.failed") += 1, "cache" => &inner.name);
                // dropping the sender resolves all handles as abandoned
                self.notify = None;
                Err(CommitError::PinnedInsert {
                    key: format!("{key:?}"),
                    source,
                })
            }
        }
    }

    fn rollback(&mut self) {
        self.settled = true;
        let removed = self
            .inner
            .with_state(|state| state.in_progress.remove(&self.key).is_some());
        self.notify = None;

        if removed {
            metric!(counter("adapter.abort") += 1, "cache" => &self.inner.name);
        }
    }
}

impl<K, V, C> Drop for Slot<K, V, C>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    C: BackingCache<K, V>,
{
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                cache = %self.inner.name,
                key = ?self.key,
                "Cache computation dropped without being finished, rolling back",
            );
            self.rollback();
        }
    }
}
