//! Transaction management module
//!
//! Runs a unit of work on an open connection: commit on success, rollback on failure.

use crate::monitoring::metrics;
use crate::service::db::core::connection::{Connection, OpFuture};
use crate::tool::error::DbError;
use tracing::{debug, error, info, warn};

/// Execute `operation` within a transaction on `conn`.
///
/// Exactly one of commit or rollback is issued. A failing operation is rolled
/// back and returned as [`DbError::Transaction`] wrapping the original cause;
/// a failing `begin` or `commit` is reported the same way.
pub async fn with_transaction<T, F>(conn: &mut dyn Connection, operation: F) -> Result<T, DbError>
where
    F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send,
    T: Send,
{
    conn.begin().await.map_err(|e| {
        error!("Failed to start transaction: {}", e);
        DbError::transaction(e)
    })?;

    debug!("Transaction started");

    match operation(&mut *conn).await {
        Ok(value) => match conn.commit().await {
            Ok(()) => {
                metrics::TRANSACTION_COMMITS.inc();
                info!("Transaction committed successfully");
                Ok(value)
            }
            Err(e) => {
                error!("Failed to commit transaction: {}", e);
                Err(DbError::transaction(e))
            }
        },
        Err(cause) => {
            if let Err(e) = conn.rollback().await {
                e.log("transaction rollback");
            }
            metrics::TRANSACTION_ROLLBACKS.inc();
            warn!("Transaction rolled back due to error: {}", cause);
            Err(DbError::transaction(cause))
        }
    }
}

/// Same as [`with_transaction`], setting the isolation level of the next
/// transaction first.
pub async fn with_transaction_isolated<T, F>(
    conn: &mut dyn Connection,
    isolation_level: IsolationLevel,
    operation: F,
) -> Result<T, DbError>
where
    F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send,
    T: Send,
{
    let isolation_sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation_level.as_str());
    conn.execute(&isolation_sql, &[]).await.map_err(|e| {
        error!("Failed to set isolation level: {}", e);
        DbError::transaction(e)
    })?;

    debug!("Transaction isolation level set to {:?}", isolation_level);
    with_transaction(conn, operation).await
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}
