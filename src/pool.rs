//! Bounded async pool of reusable connections.
//!
//! At most `max_conns` values are checked out at once. A checked out value
//! goes back to the idle list when its guard drops, unless it was
//! discarded. New values are made on demand by the factory.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::exec::ExecError;

type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, ExecError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_conns: usize,
    /// How long `acquire` waits for a free slot, forever when `None`
    pub max_wait: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_conns: 16,
            max_wait: Some(Duration::from_secs(5)),
        }
    }
}

impl From<&Config> for PoolOptions {
    fn from(conf: &Config) -> Self {
        Self {
            max_conns: conf.db_max_conns,
            max_wait: (conf.db_pool_wait_ms > 0).then(|| Duration::from_millis(conf.db_pool_wait_ms)),
        }
    }
}

pub struct Pool<T> {
    opts: PoolOptions,
    factory: Factory<T>,
    idle: Mutex<Vec<T>>,
    slots: Arc<Semaphore>,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<F, Fut>(opts: PoolOptions, factory: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ExecError>> + Send + 'static,
    {
        let opts = PoolOptions {
            max_conns: opts.max_conns.max(1),
            ..opts
        };
        Arc::new(Self {
            factory: Box::new(move || Box::pin(factory()) as BoxFuture<'static, _>),
            idle: Mutex::new(Vec::new()),
            slots: Arc::new(Semaphore::new(opts.max_conns)),
            opts,
        })
    }

    /// Wait for a free slot and hand out an idle value, or make a new one.
    pub async fn acquire(self: &Arc<Self>) -> Result<Pooled<T>, ExecError> {
        let slot = self.slots.clone().acquire_owned();
        let permit = match self.opts.max_wait {
            Some(limit) => tokio::time::timeout(limit, slot)
                .await
                .map_err(|_| ExecError::PoolTimeout(limit))?,
            None => slot.await,
        }
        .map_err(|_| ExecError::PoolClosed)?;

        let idle = self.idle.lock().pop();
        let value = match idle {
            Some(v) => v,
            None => (self.factory)().await?,
        };
        Ok(Pooled {
            pool: self.clone(),
            value: Some(value),
            _permit: permit,
        })
    }

    pub fn options(&self) -> PoolOptions {
        self.opts
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Values checked out right now.
    pub fn in_use(&self) -> usize {
        self.opts.max_conns - self.slots.available_permits()
    }
}

/// A checked out value. Returns to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
    _permit: OwnedSemaphorePermit,
}

impl<T> Pooled<T> {
    /// Drop the value instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        self.value = None;
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value taken")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value taken")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        // the permit is released after this, so the value is idle first
        if let Some(v) = self.value.take() {
            self.pool.idle.lock().push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(max_conns: usize, wait_ms: u64) -> (Arc<Pool<usize>>, Arc<AtomicUsize>) {
        let made = Arc::new(AtomicUsize::new(0));
        let m = made.clone();
        let pool = Pool::new(
            PoolOptions {
                max_conns,
                max_wait: Some(Duration::from_millis(wait_ms)),
            },
            move || {
                let n = m.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            },
        );
        (pool, made)
    }

    #[tokio::test]
    async fn test_values_are_reused() {
        let (pool, made) = counting(2, 50);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!((*a, *b), (0, 1));
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.idle_count(), 1);

        let c = pool.acquire().await.unwrap();
        assert_eq!(*c, 0);
        assert_eq!(made.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_pool_times_out() {
        let (pool, _) = counting(1, 10);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, ExecError::PoolTimeout(_)));
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let (pool, _) = counting(1, 1000);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await.unwrap() })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_makes_a_new_value() {
        let (pool, made) = counting(1, 50);
        pool.acquire().await.unwrap().discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(*pool.acquire().await.unwrap(), 1);
        assert_eq!(made.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_factory_error_frees_the_slot() {
        let pool: Arc<Pool<usize>> = Pool::new(
            PoolOptions {
                max_conns: 1,
                max_wait: Some(Duration::from_millis(10)),
            },
            || async { Err(ExecError::Connect("refused".into())) },
        );
        assert!(matches!(pool.acquire().await, Err(ExecError::Connect(_))));
        assert!(matches!(pool.acquire().await, Err(ExecError::Connect(_))));
        assert_eq!(pool.in_use(), 0);
    }
}
