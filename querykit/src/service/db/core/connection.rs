//! 연결 관리 모듈
//!
//! Connection scope management: one connection per call, released on every exit path.

use crate::monitoring::metrics;
use crate::service::db::core::config::QueryConfig;
use crate::service::db::core::executor::LoggedConnection;
use crate::service::db::core::types::{ConnectionStats, QueryRow, SqlValue};
use crate::tool::error::DbError;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Boxed future returned by operations that borrow a connection.
pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// An open database session.
///
/// Owned by exactly one caller for the lifetime of one operation.
#[async_trait]
pub trait Connection: Send {
    /// Run a read query and return its rows in order.
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<QueryRow>, DbError>;

    /// Run a write statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Whether a transaction is currently open on this session.
    fn in_transaction(&self) -> bool;
}

/// Hands out connections and takes them back.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Connection>, DbError>;

    /// Close (or return to the pool) a connection obtained from `acquire`.
    async fn release(&self, conn: Box<dyn Connection>);

    fn name(&self) -> &str {
        "database"
    }
}

/// 내부 통계 추적기
#[derive(Debug, Default)]
pub(crate) struct ConnectionStatistics {
    pub(crate) acquired: AtomicU64,
    pub(crate) released: AtomicU64,
    pub(crate) connection_errors: AtomicU64,
    pub(crate) total_queries: AtomicU64,
    pub(crate) slow_queries: AtomicU64,
}

impl ConnectionStatistics {
    pub(crate) fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_slow_query(&self) {
        self.slow_queries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connection scope manager.
///
/// `with_connection` acquires a fresh connection, lends it to the operation
/// and releases it exactly once whatever the outcome.
#[derive(Clone)]
pub struct ConnectionManager {
    source: Arc<dyn ConnectionSource>,
    query_config: QueryConfig,
    stats: Arc<ConnectionStatistics>,
}

impl ConnectionManager {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self::with_query_config(source, QueryConfig::default())
    }

    pub fn with_query_config(source: Arc<dyn ConnectionSource>, query_config: QueryConfig) -> Self {
        Self {
            source,
            query_config,
            stats: Arc::new(ConnectionStatistics::default()),
        }
    }

    /// Run `operation` with a connection scoped to this call.
    ///
    /// Acquisition failure returns [`DbError::Connection`] without invoking
    /// the operation. Operation failures are passed through unchanged.
    pub async fn with_connection<T, F>(&self, operation: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        self.scoped(None, operation).await
    }

    /// Like [`with_connection`](Self::with_connection), aborting the operation
    /// when `cancel` fires. The connection is still released, and any open
    /// transaction rolled back, before [`DbError::Cancelled`] is returned.
    pub async fn with_connection_cancellable<T, F>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        self.scoped(Some(cancel), operation).await
    }

    async fn scoped<T, F>(
        &self,
        cancel: Option<&CancellationToken>,
        operation: F,
    ) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        if cancel.map_or(false, |token| token.is_cancelled()) {
            return Err(cancelled());
        }

        let raw = self.acquire().await?;
        let mut guard = ReleaseGuard {
            conn: Some(LoggedConnection::new(raw, self.query_config.clone(), self.stats.clone())),
            source: self.source.clone(),
            stats: self.stats.clone(),
        };

        let result = match guard.conn.as_mut() {
            Some(conn) => {
                let scoped: &mut dyn Connection = conn;
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                warn!("operation cancelled on {}", self.source.name());
                                Err(cancelled())
                            }
                            result = operation(scoped) => result,
                        }
                    }
                    None => operation(scoped).await,
                }
            }
            None => Err(DbError::Connection("connection already released".to_string())),
        };

        guard.release().await;
        result
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>, DbError> {
        match self.source.acquire().await {
            Ok(conn) => {
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                metrics::CONNECTIONS_ACQUIRED.inc();
                debug!("Connection acquired from {}", self.source.name());
                Ok(conn)
            }
            Err(e) => {
                self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                metrics::CONNECTION_ERRORS.inc();
                error!("Failed to acquire connection from {}: {}", self.source.name(), e);
                Err(match e {
                    DbError::Connection(_) => e,
                    other => DbError::Connection(other.to_string()),
                })
            }
        }
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let acquired = self.stats.acquired.load(Ordering::Relaxed);
        let released = self.stats.released.load(Ordering::Relaxed);
        ConnectionStats {
            acquired,
            released,
            active: acquired.saturating_sub(released),
            connection_errors: self.stats.connection_errors.load(Ordering::Relaxed),
            total_queries: self.stats.total_queries.load(Ordering::Relaxed),
            slow_queries: self.stats.slow_queries.load(Ordering::Relaxed),
        }
    }
}

/// Owns a scoped connection until it has been handed back to its source.
///
/// Dropped while still holding the connection (the caller's future was
/// dropped, or the operation panicked), it releases on a background task.
struct ReleaseGuard {
    conn: Option<LoggedConnection>,
    source: Arc<dyn ConnectionSource>,
    stats: Arc<ConnectionStatistics>,
}

impl ReleaseGuard {
    async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let task = release_connection(self.source.clone(), self.stats.clone(), conn.into_inner());

        // Runs detached so dropping the caller mid-release cannot interrupt it.
        match Handle::try_current() {
            Ok(handle) => {
                if let Err(e) = handle.spawn(task).await {
                    error!("Connection release task failed: {}", e);
                }
            }
            Err(_) => task.await,
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!(
            "Operation abandoned on {}, releasing connection in the background",
            self.source.name()
        );
        let task = release_connection(self.source.clone(), self.stats.clone(), conn.into_inner());
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => error!("No runtime to release connection to {}", self.source.name()),
        }
    }
}

/// Roll back any open transaction, then return the connection to `source`.
async fn release_connection(
    source: Arc<dyn ConnectionSource>,
    stats: Arc<ConnectionStatistics>,
    mut conn: Box<dyn Connection>,
) {
    if conn.in_transaction() {
        warn!("Connection released inside an open transaction, rolling back");
        if let Err(e) = conn.rollback().await {
            e.log("rollback on release");
        }
        metrics::TRANSACTION_ROLLBACKS.inc();
    }

    source.release(conn).await;
    stats.released.fetch_add(1, Ordering::Relaxed);
    debug!("Connection released to {}", source.name());
}

fn cancelled() -> DbError {
    DbError::Cancelled {
        operation: "with_connection".to_string(),
        attempts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::db::memory::MemoryDatabase;
    use std::time::Duration;

    fn manager(db: &MemoryDatabase) -> ConnectionManager {
        ConnectionManager::new(Arc::new(db.clone()))
    }

    #[tokio::test]
    async fn test_releases_once_on_success() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let manager = manager(&db);

        let rows = manager
            .with_connection(|conn| {
                Box::pin(async move { conn.fetch_all("SELECT * FROM users", &[]).await })
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(db.stats().opened, 1);
        assert_eq!(db.stats().closed, 1);
        assert_eq!(manager.stats().active, 0);
        assert_eq!(manager.stats().total_queries, 1);
    }

    #[tokio::test]
    async fn test_releases_once_on_failure_and_passes_error_through() {
        let db = MemoryDatabase::new();
        let manager = manager(&db);

        let err = manager
            .with_connection(|conn| {
                Box::pin(async move { conn.fetch_all("SELECT * FROM missing", &[]).await })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Query(_)));
        assert_eq!(db.stats().opened, 1);
        assert_eq!(db.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_skips_operation() {
        let db = MemoryDatabase::new();
        db.fail_next_acquire(1);
        let manager = manager(&db);
        let invoked = Arc::new(AtomicU64::new(0));
        let seen = invoked.clone();

        let err = manager
            .with_connection(move |_conn| {
                seen.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Connection(_)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(db.stats().opened, 0);
        assert_eq!(db.stats().closed, 0);
        assert_eq!(manager.stats().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_and_rolls_back() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let manager = manager(&db);
        let token = CancellationToken::new();
        let trigger = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = manager
            .with_connection_cancellable(&token, |conn| {
                Box::pin(async move {
                    conn.begin().await?;
                    conn.execute("DELETE FROM users", &[]).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    conn.commit().await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Cancelled { .. }));
        assert_eq!(db.stats().closed, 1);
        assert_eq!(db.stats().rollbacks, 1);
        assert_eq!(db.stats().commits, 0);
        assert_eq!(db.row_count("users"), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_releases_and_rolls_back() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let manager = manager(&db);

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            manager.with_connection(|conn| {
                Box::pin(async move {
                    conn.begin().await?;
                    conn.execute("DELETE FROM users", &[]).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    conn.commit().await
                })
            }),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = db.stats();
        assert_eq!((stats.opened, stats.closed), (1, 1));
        assert_eq!((stats.commits, stats.rollbacks), (0, 1));
        assert_eq!(db.row_count("users"), 1);
        assert_eq!(manager.stats().active, 0);
    }

    #[tokio::test]
    async fn test_panicking_operation_still_releases() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let manager = manager(&db);

        let task = tokio::spawn(async move {
            manager
                .with_connection(|conn| {
                    Box::pin(async move {
                        conn.begin().await?;
                        let rows = conn.fetch_all("SELECT * FROM users", &[]).await?;
                        assert!(rows.is_empty(), "users table should be empty");
                        Ok(())
                    })
                })
                .await
        });
        let join = task.await.unwrap_err();
        assert!(join.is_panic());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = db.stats();
        assert_eq!((stats.opened, stats.closed), (1, 1));
        assert_eq!(stats.rollbacks, 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_acquire() {
        let db = MemoryDatabase::new();
        let manager = manager(&db);
        let token = CancellationToken::new();
        token.cancel();

        let err = manager
            .with_connection_cancellable(&token, |_conn| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Cancelled { .. }));
        assert_eq!(db.stats().opened, 0);
    }
}
