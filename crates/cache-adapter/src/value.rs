use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

/// The computation a [`SharedValue`] was observing ended without a committed value.
///
/// This happens when the responsible caller aborted (or dropped) its
/// [`Responsibility`](crate::Responsibility), or when the commit itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("computation was abandoned before it was committed")]
pub struct Abandoned;

type ReadyChannel<V> = Shared<oneshot::Receiver<Arc<V>>>;

enum Phase<V> {
    /// The value was already committed when this handle was created.
    Ready(Arc<V>),
    /// The value is still being computed by its responsible caller.
    Pending(ReadyChannel<V>),
}

/// A shared handle to a value that is either committed or still in flight.
///
/// While the computation is pending, holders can only observe that it exists and wait for it.
/// Once committed, the value is immutable and shared via [`Arc`].
pub struct SharedValue<V> {
    phase: Phase<V>,
}

/// The sending half of a pending [`SharedValue`], owned by the responsible caller.
pub(crate) type ReadySender<V> = oneshot::Sender<Arc<V>>;

impl<V> SharedValue<V> {
    /// Creates a handle on an already committed value.
    pub(crate) fn committed(value: Arc<V>) -> Self {
        Self {
            phase: Phase::Ready(value),
        }
    }

    /// Creates a handle on a computation that is resolved via the returned sender.
    ///
    /// Dropping the sender without sending resolves all handles with [`Abandoned`].
    pub(crate) fn pending() -> (ReadySender<V>, Self) {
        let (sender, receiver) = oneshot::channel();
        let handle = Self {
            phase: Phase::Pending(receiver.shared()),
        };
        (sender, handle)
    }

    /// Returns the committed value without blocking, if there is one.
    pub fn get(&self) -> Option<Arc<V>> {
        match &self.phase {
            Phase::Ready(value) => Some(Arc::clone(value)),
            Phase::Pending(channel) => channel.clone().now_or_never()?.ok(),
        }
    }

    /// Whether the value has been committed.
    ///
    /// This returns `false` for computations that were abandoned.
    pub fn is_ready(&self) -> bool {
        self.get().is_some()
    }

    /// Whether the computation behind this handle ended without a committed value.
    pub fn is_abandoned(&self) -> bool {
        match &self.phase {
            Phase::Ready(_) => false,
            Phase::Pending(channel) => matches!(channel.clone().now_or_never(), Some(Err(_))),
        }
    }

    /// Blocks the current thread until the value is committed or the computation is abandoned.
    ///
    /// Do not call this from within an async runtime, await [`SharedValue::ready`] instead.
    pub fn wait(&self) -> Result<Arc<V>, Abandoned> {
        match &self.phase {
            Phase::Ready(value) => Ok(Arc::clone(value)),
            Phase::Pending(channel) => {
                futures::executor::block_on(channel.clone()).map_err(|_| Abandoned)
            }
        }
    }

    /// Returns `true` if both handles observe the same value or computation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.phase, &other.phase) {
            (Phase::Ready(a), Phase::Ready(b)) => Arc::ptr_eq(a, b),
            (Phase::Pending(a), Phase::Pending(b)) => a.ptr_eq(b),
            (Phase::Ready(value), Phase::Pending(channel))
            | (Phase::Pending(channel), Phase::Ready(value)) => {
                // a pending handle that was resolved observes the same value as the cache
                match channel.clone().now_or_never() {
                    Some(Ok(resolved)) => Arc::ptr_eq(value, &resolved),
                    _ => false,
                }
            }
        }
    }
}

impl<V: Send + Sync + 'static> SharedValue<V> {
    /// A future resolving once the value is committed or the computation is abandoned.
    pub fn ready(&self) -> BoxFuture<'static, Result<Arc<V>, Abandoned>> {
        match &self.phase {
            Phase::Ready(value) => futures::future::ready(Ok(Arc::clone(value))).boxed(),
            Phase::Pending(channel) => channel.clone().map(|res| res.map_err(|_| Abandoned)).boxed(),
        }
    }
}

impl<V: Send + Sync + 'static> IntoFuture for SharedValue<V> {
    type Output = Result<Arc<V>, Abandoned>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        SharedValue::ready(&self)
    }
}

impl<V> Clone for SharedValue<V> {
    fn clone(&self) -> Self {
        let phase = match &self.phase {
            Phase::Ready(value) => Phase::Ready(Arc::clone(value)),
            Phase::Pending(channel) => Phase::Pending(channel.clone()),
        };
        Self { phase }
    }
}

impl<V: fmt::Debug> fmt::Debug for SharedValue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.phase {
            Phase::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Phase::Pending(_) => match self.get() {
                Some(value) => f.debug_tuple("Ready").field(&value).finish(),
                None if self.is_abandoned() => f.write_str("Abandoned"),
                None => f.write_str("Pending"),
            },
        }
    }
}
