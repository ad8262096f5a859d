//! Bounded, growable free list of reusable items.
//!
//! A [`FreeList`] starts with `initial` items, grows by `increment` whenever
//! it runs dry, and never holds more than `max` items in total. Items are
//! handed out as [`Pooled`] guards: dropping the guard resets the item and
//! returns it, waking one blocked waiter and every async subscriber.
//!
//! Blocking waiters park on a `parking_lot::Condvar`. Async callers that must
//! not block (the reactor) use [`FreeList::subscribe_releases`] and retry
//! [`FreeList::try_get`] once the release counter moves.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{PoolError, PoolResult};

/// Items stored in a free list are reset before they are reused.
pub trait Reset {
    /// Restore the item to its freshly created state.
    fn reset(&mut self);
}

/// Capacity bounds for a [`FreeList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeListConfig {
    /// Nominal size of each element in bytes (used by buffer factories).
    pub element_size: usize,
    /// Number of items created up front.
    pub initial: usize,
    /// Hard upper bound on items alive at once.
    pub max: usize,
    /// Number of items created per growth step.
    pub increment: usize,
}

impl Default for FreeListConfig {
    fn default() -> Self {
        Self {
            element_size: 4096,
            initial: 8,
            max: 1024,
            increment: 8,
        }
    }
}

impl FreeListConfig {
    /// Create a configuration with explicit bounds.
    pub fn new(element_size: usize, initial: usize, max: usize, increment: usize) -> Self {
        Self {
            element_size,
            initial,
            max,
            increment,
        }
    }

    /// Check the bounds for consistency.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max < self.initial {
            return Err(PoolError::Config(format!(
                "max ({}) is smaller than initial ({})",
                self.max, self.initial
            )));
        }
        if self.max == 0 {
            return Err(PoolError::Config("max must be at least 1".to_string()));
        }
        if self.increment == 0 && self.max > self.initial {
            return Err(PoolError::Config(
                "increment must be non-zero when max exceeds initial".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters of a [`FreeList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Items created and not yet destroyed.
    pub allocated: usize,
    /// Items sitting in the free stack.
    pub free: usize,
    /// Items currently handed out.
    pub in_use: usize,
    /// Threads blocked in `wait_get`.
    pub waiters: usize,
}

struct State<T> {
    free: Vec<T>,
    allocated: usize,
    waiters: usize,
    closed: bool,
}

struct Inner<T> {
    config: FreeListConfig,
    state: Mutex<State<T>>,
    available: Condvar,
    releases: watch::Sender<u64>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

/// A bounded pool of reusable items.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct FreeList<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FreeList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for FreeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FreeList")
            .field("config", &self.inner.config)
            .field("allocated", &state.allocated)
            .field("free", &state.free.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Reset + Send + 'static> FreeList<T> {
    /// Create a pool and pre-allocate `config.initial` items with `factory`.
    pub fn new<F>(config: FreeListConfig, factory: F) -> PoolResult<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        config.validate()?;
        let free: Vec<T> = (0..config.initial).map(|_| factory()).collect();
        let (releases, _) = watch::channel(0);
        tracing::debug!(
            initial = config.initial,
            max = config.max,
            increment = config.increment,
            "free list initialized"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    allocated: free.len(),
                    free,
                    waiters: 0,
                    closed: false,
                }),
                config,
                available: Condvar::new(),
                releases,
                factory: Box::new(factory),
            }),
        })
    }

    /// Take an item without blocking.
    ///
    /// Grows the pool if it is empty and below `max`; otherwise fails with
    /// [`PoolError::OutOfResource`].
    pub fn try_get(&self) -> PoolResult<Pooled<T>> {
        let mut state = self.inner.state.lock();
        let item = self.pop_locked(&mut state)?;
        Ok(self.wrap(item))
    }

    /// Take an item, blocking the calling thread until one is released.
    pub fn wait_get(&self) -> PoolResult<Pooled<T>> {
        let mut state = self.inner.state.lock();
        loop {
            match self.pop_locked(&mut state) {
                Err(PoolError::OutOfResource) => {
                    state.waiters += 1;
                    self.inner.available.wait(&mut state);
                    state.waiters -= 1;
                }
                other => return other.map(|item| self.wrap(item)),
            }
        }
    }

    /// Like [`wait_get`](Self::wait_get) but gives up at `deadline`.
    pub fn wait_get_until(&self, deadline: Instant) -> PoolResult<Pooled<T>> {
        let mut state = self.inner.state.lock();
        loop {
            match self.pop_locked(&mut state) {
                Err(PoolError::OutOfResource) => {
                    state.waiters += 1;
                    let result = self.inner.available.wait_until(&mut state, deadline);
                    state.waiters -= 1;
                    if result.timed_out() {
                        return match self.pop_locked(&mut state) {
                            Err(PoolError::OutOfResource) => Err(PoolError::Timeout),
                            other => other.map(|item| self.wrap(item)),
                        };
                    }
                }
                other => return other.map(|item| self.wrap(item)),
            }
        }
    }

    /// Return an item to the pool. Equivalent to dropping the guard.
    pub fn put(&self, item: Pooled<T>) {
        drop(item);
    }

    /// Subscribe to release notifications.
    ///
    /// The receiver's `changed()` resolves after the next item is returned or
    /// the pool is closed. Mark the current value seen (`borrow_and_update`)
    /// before retrying [`try_get`](Self::try_get) so no release is missed.
    pub fn subscribe_releases(&self) -> watch::Receiver<u64> {
        self.inner.releases.subscribe()
    }

    /// Close the pool and return the number of items still handed out.
    ///
    /// Blocked waiters fail with [`PoolError::Shutdown`]. Items returned after
    /// close are destroyed instead of being recycled.
    pub fn close(&self) -> usize {
        let outstanding = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return state.allocated;
            }
            state.closed = true;
            let free = state.free.len();
            state.free.clear();
            state.allocated -= free;
            state.allocated
        };
        self.inner.available.notify_all();
        self.inner.releases.send_modify(|n| *n = n.wrapping_add(1));
        if outstanding > 0 {
            tracing::debug!(outstanding, "free list closed with items still in use");
        }
        outstanding
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            allocated: state.allocated,
            free: state.free.len(),
            in_use: state.allocated - state.free.len(),
            waiters: state.waiters,
        }
    }

    /// Configured bounds.
    pub fn config(&self) -> &FreeListConfig {
        &self.inner.config
    }

    fn pop_locked(&self, state: &mut State<T>) -> PoolResult<T> {
        if state.closed {
            return Err(PoolError::Shutdown);
        }
        if let Some(item) = state.free.pop() {
            return Ok(item);
        }
        let config = &self.inner.config;
        if state.allocated >= config.max {
            return Err(PoolError::OutOfResource);
        }
        let grow = config.increment.max(1).min(config.max - state.allocated);
        for _ in 1..grow {
            state.free.push((self.inner.factory)());
        }
        state.allocated += grow;
        tracing::trace!(grow, allocated = state.allocated, "free list grew");
        Ok((self.inner.factory)())
    }

    fn wrap(&self, item: T) -> Pooled<T> {
        Pooled {
            item: Some(item),
            pool: Arc::clone(&self.inner) as Arc<dyn Recycle<T>>,
        }
    }
}

trait Recycle<T>: Send + Sync {
    fn recycle(&self, item: T);
}

impl<T: Reset + Send + 'static> Recycle<T> for Inner<T> {
    fn recycle(&self, mut item: T) {
        item.reset();
        let wake = {
            let mut state = self.state.lock();
            if state.closed {
                state.allocated -= 1;
                false
            } else {
                state.free.push(item);
                true
            }
        };
        if wake {
            self.available.notify_one();
            self.releases.send_modify(|n| *n = n.wrapping_add(1));
        }
    }
}

/// Exclusive handle to an item taken from a [`FreeList`].
///
/// The item goes back to its pool when the handle is dropped.
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<dyn Recycle<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.recycle(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Slot {
        value: u32,
        resets: usize,
    }

    impl Reset for Slot {
        fn reset(&mut self) {
            self.value = 0;
            self.resets += 1;
        }
    }

    fn pool(initial: usize, max: usize, increment: usize) -> FreeList<Slot> {
        FreeList::new(FreeListConfig::new(0, initial, max, increment), Slot::default)
            .expect("valid config")
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            FreeList::new(FreeListConfig::new(0, 4, 2, 1), Slot::default),
            Err(PoolError::Config(_))
        ));
        assert!(matches!(
            FreeList::new(FreeListConfig::new(0, 1, 4, 0), Slot::default),
            Err(PoolError::Config(_))
        ));
        assert!(FreeList::new(FreeListConfig::new(0, 2, 2, 0), Slot::default).is_ok());
    }

    #[test]
    fn test_grow_to_max_then_exhaust() {
        let pool = pool(1, 2, 1);
        let a = pool.try_get().expect("initial item");
        let b = pool.try_get().expect("grown item");
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.try_get().err(), Some(PoolError::OutOfResource));
        drop(a);
        let c = pool.try_get().expect("recycled item");
        assert_eq!(c.resets, 1);
        drop(b);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn test_growth_clamped_to_max() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = FreeList::new(FreeListConfig::new(0, 1, 3, 10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Slot::default()
        })
        .expect("valid config");
        let _held: Vec<_> = (0..3).map(|_| pool.try_get().expect("item")).collect();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.try_get().err(), Some(PoolError::OutOfResource));
    }

    #[test]
    fn test_items_are_reset_on_return() {
        let pool = pool(1, 1, 0);
        let mut item = pool.try_get().expect("item");
        item.value = 42;
        pool.put(item);
        let item = pool.try_get().expect("item");
        assert_eq!(item.value, 0);
        assert_eq!(item.resets, 1);
    }

    #[test]
    fn test_wait_get_wakes_on_release() {
        let pool = pool(1, 2, 1);
        let a = pool.try_get().expect("a");
        let _b = pool.try_get().expect("b");

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.wait_get().map(|item| item.resets))
        };
        while pool.stats().waiters == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(a);
        assert_eq!(waiter.join().expect("join"), Ok(1));
    }

    #[test]
    fn test_wait_get_until_times_out() {
        let pool = pool(1, 1, 0);
        let _held = pool.try_get().expect("item");
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(pool.wait_get_until(deadline).err(), Some(PoolError::Timeout));
        assert_eq!(pool.stats().waiters, 0);
    }

    #[test]
    fn test_close_reports_outstanding_and_fails_waiters() {
        let pool = pool(2, 2, 0);
        let a = pool.try_get().expect("a");
        let _b = pool.try_get().expect("b");

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.wait_get().err())
        };
        while pool.stats().waiters == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.close(), 2);
        assert_eq!(waiter.join().expect("join"), Some(PoolError::Shutdown));

        drop(a);
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.try_get().err(), Some(PoolError::Shutdown));
    }

    #[tokio::test]
    async fn test_release_subscription_fires() {
        let pool = pool(1, 1, 0);
        let held = pool.try_get().expect("item");
        let mut releases = pool.subscribe_releases();
        releases.borrow_and_update();
        assert_eq!(pool.try_get().err(), Some(PoolError::OutOfResource));
        drop(held);
        releases.changed().await.expect("sender alive");
        assert!(pool.try_get().is_ok());
    }
}
