//! Generic bounded client pool
//!
//! STT, TTS and LLM handles are expensive long-lived connections, so they are
//! pooled rather than dialed per call. The pool guarantees a leased handle is
//! never shared, caps concurrently leased handles at the configured size, and
//! on an upstream error the lease is discarded instead of returned so a fresh
//! handle is dialed for the next session.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ClientError;

type Factory<T> =
    Box<dyn Fn() -> BoxFuture<'static, Result<Box<T>, ClientError>> + Send + Sync + 'static>;

/// Snapshot of pool occupancy for the readiness endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub leased: usize,
    pub idle: usize,
    pub healthy: bool,
}

struct PoolInner<T: ?Sized + Send> {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Box<T>>>,
    factory: Factory<T>,
    leased: AtomicUsize,
    healthy: AtomicBool,
}

/// Bounded pool of exclusive upstream handles.
pub struct ClientPool<T: ?Sized + Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: ?Sized + Send + 'static> Clone for ClientPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + 'static> ClientPool<T> {
    pub fn new(name: &'static str, capacity: usize, factory: Factory<T>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::new()),
                factory,
                leased: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Lease one exclusive handle, dialing a fresh one if no idle handle is
    /// warm. Waits while the pool is at capacity.
    pub async fn acquire(&self) -> Result<Lease<T>, ClientError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::ConnectionFailed("pool closed".into()))?;

        let warm = self.inner.idle.lock().pop();
        let handle = match warm {
            Some(handle) => {
                debug!(pool = self.inner.name, "reusing idle handle");
                handle
            }
            None => match (self.inner.factory)().await {
                Ok(handle) => {
                    self.inner.healthy.store(true, Ordering::Release);
                    handle
                }
                Err(e) => {
                    warn!(pool = self.inner.name, error = %e, "handle factory failed");
                    if matches!(e, ClientError::ConfigurationError(_)) {
                        self.inner.healthy.store(false, Ordering::Release);
                    }
                    return Err(e);
                }
            },
        };

        self.inner.leased.fetch_add(1, Ordering::AcqRel);
        Ok(Lease {
            handle: Some(handle),
            pool: self.inner.clone(),
            _permit: permit,
            discard: false,
        })
    }

    /// [`Self::acquire`] bounded by a wall clock, for session setup paths
    /// that must fail fast when capacity is exhausted.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<Lease<T>, ClientError> {
        timeout(wait, self.acquire()).await.map_err(|_| {
            ClientError::ConnectionFailed(format!(
                "{} pool exhausted after {:?}",
                self.inner.name, wait
            ))
        })?
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            leased: self.inner.leased.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            healthy: self.inner.healthy.load(Ordering::Acquire),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }
}

/// Exclusive lease over one pooled handle. Returns the handle to the idle
/// list on drop unless [`Lease::discard`] was called.
pub struct Lease<T: ?Sized + Send + 'static> {
    /// Always `Some` until `Drop` takes it; the deref impls rely on this.
    handle: Option<Box<T>>,
    pool: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
    discard: bool,
}

impl<T: ?Sized + Send + 'static> Lease<T> {
    /// Mark the handle as broken; it is dropped instead of returned so the
    /// next lease dials a fresh connection.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<T: ?Sized + Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("lease already dropped")
    }
}

impl<T: ?Sized + Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("lease already dropped")
    }
}

impl<T: ?Sized + Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        self.pool.leased.fetch_sub(1, Ordering::AcqRel);
        if let Some(handle) = self.handle.take() {
            if self.discard {
                debug!(pool = self.pool.name, "discarding broken handle");
            } else {
                self.pool.idle.lock().push(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter(u32);

    fn counting_pool(capacity: usize, created: Arc<AtomicU32>) -> ClientPool<Counter> {
        ClientPool::new(
            "test",
            capacity,
            Box::new(move || {
                let created = created.clone();
                Box::pin(async move {
                    let n = created.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(Counter(n)))
                })
            }),
        )
    }

    #[tokio::test]
    async fn test_lease_returns_to_idle() {
        let created = Arc::new(AtomicU32::new(0));
        let pool = counting_pool(4, created.clone());

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().leased, 1);
        drop(lease);

        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 1);

        // Second acquire reuses the warm handle; nothing new is created.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.0, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discarded_lease_is_not_reused() {
        let created = Arc::new(AtomicU32::new(0));
        let pool = counting_pool(4, created.clone());

        let mut lease = pool.acquire().await.unwrap();
        lease.discard();
        drop(lease);

        assert_eq!(pool.stats().idle, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.0, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let created = Arc::new(AtomicU32::new(0));
        let pool = counting_pool(1, created);

        let _held = pool.acquire().await.unwrap();
        let second = pool.acquire_timeout(Duration::from_millis(50)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_waiting_acquire_proceeds_after_release() {
        let created = Arc::new(AtomicU32::new(0));
        let pool = counting_pool(1, created);

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.0, 0);
    }

    #[tokio::test]
    async fn test_config_error_marks_pool_unhealthy() {
        let pool: ClientPool<Counter> = ClientPool::new(
            "broken",
            2,
            Box::new(|| {
                Box::pin(async {
                    Err(ClientError::ConfigurationError("missing api key".into()))
                })
            }),
        );

        assert!(pool.acquire().await.is_err());
        assert!(!pool.is_healthy());
    }
}
