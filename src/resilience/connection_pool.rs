//! Bounded pool of reusable upstream connections.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ResilienceConfig;
use crate::error::ProviderError;
use crate::sync::lock;

/// Opens new connections for a pool.
#[async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    async fn connect(&self) -> Result<C, ProviderError>;
}

struct PoolInner<C> {
    provider: String,
    factory: Arc<dyn ConnectionFactory<C>>,
    idle: Mutex<Vec<C>>,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

/// At most `max_connections` connections are checked out at once; released
/// connections are kept idle and reused.
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(
        provider: impl Into<String>,
        max_connections: usize,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider: provider.into(),
                factory,
                idle: Mutex::new(Vec::with_capacity(max_connections)),
                permits: Arc::new(Semaphore::new(max_connections)),
                max_connections,
            }),
        }
    }

    /// Pool sized by `config.max_connections`.
    pub fn from_config(
        provider: impl Into<String>,
        config: &ResilienceConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Self {
        Self::new(provider, config.max_connections, factory)
    }

    /// Check out a connection, waiting for a free slot. Reuses an idle
    /// connection when one exists, otherwise opens a new one.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, ProviderError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::PoolClosed {
                provider: self.inner.provider.clone(),
            })?;

        let reused = lock(&self.inner.idle).pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                tracing::debug!(provider = %self.inner.provider, "Opening new connection");
                self.inner.factory.connect().await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Refuse further checkouts and drop idle connections.
    pub fn close(&self) {
        self.inner.permits.close();
        lock(&self.inner.idle).clear();
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.max_connections - self.inner.permits.available_permits()
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection<C> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C> PooledConnection<C> {
    /// Drop the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !self.pool.permits.is_closed()
        {
            lock(&self.pool.idle).push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory<usize> for CountingFactory {
        async fn connect(&self) -> Result<usize, ProviderError> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(max: usize) -> (ConnectionPool<usize>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            opened: AtomicUsize::new(0),
        });
        (ConnectionPool::new("test", max, factory.clone()), factory)
    }

    #[tokio::test]
    async fn from_config_bounds_by_max_connections() {
        let config = ResilienceConfig {
            max_connections: 1,
            ..ResilienceConfig::default()
        };
        let factory = Arc::new(CountingFactory {
            opened: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::<usize>::from_config("tts", &config, factory);
        let _held = pool.acquire().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
        assert!(blocked.is_err());
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let (pool, factory) = pool(2);
        let first = *pool.acquire().await.unwrap();
        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, first);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn waits_when_all_connections_are_checked_out() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
        assert!(blocked.is_err(), "second checkout should wait");

        drop(held);
        let conn = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*conn, 0);
    }

    #[tokio::test]
    async fn discarded_connections_are_replaced() {
        let (pool, factory) = pool(1);
        pool.acquire().await.unwrap().discard();
        assert_eq!(pool.idle_count(), 0);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkout() {
        let (pool, _) = pool(1);
        pool.close();
        assert!(matches!(
            pool.acquire().await,
            Err(ProviderError::PoolClosed { .. })
        ));
    }
}
