//! 쿼리 실행 모듈
//!
//! Statement logging, timing and slow-query reporting for managed connections.

use crate::monitoring::metrics::Metrics;
use crate::service::db::core::config::QueryConfig;
use crate::service::db::core::connection::{Connection, ConnectionStatistics};
use crate::service::db::core::types::{preview_sql, QueryRow, SqlValue};
use crate::tool::error::DbError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Connection decorator that logs and times every statement.
pub struct LoggedConnection {
    inner: Box<dyn Connection>,
    config: QueryConfig,
    stats: Arc<ConnectionStatistics>,
}

impl LoggedConnection {
    pub(crate) fn new(
        inner: Box<dyn Connection>,
        config: QueryConfig,
        stats: Arc<ConnectionStatistics>,
    ) -> Self {
        Self {
            inner,
            config,
            stats,
        }
    }

    pub(crate) fn into_inner(self) -> Box<dyn Connection> {
        self.inner
    }

    /// Log query if enabled
    fn log_query(&self, kind: &str, sql: &str, params: &[SqlValue]) {
        if !self.config.enable_query_logging {
            return;
        }
        if params.is_empty() {
            debug!("Executing {}: {}", kind, sql);
        } else {
            debug!("Executing {}: {} | Params: {:?}", kind, sql, params);
        }
    }

    /// Check for slow queries
    fn finish(&self, kind: &str, sql: &str, started: Instant) {
        self.stats.record_query();
        Metrics::record_query(kind, started.elapsed());
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.config.slow_query_threshold_ms {
            self.stats.record_slow_query();
            warn!("Slow query detected ({} ms): {}", elapsed_ms, preview_sql(sql));
        }
    }
}

#[async_trait]
impl Connection for LoggedConnection {
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<QueryRow>, DbError> {
        self.log_query("query", sql, params);
        let started = Instant::now();
        let result = self.inner.fetch_all(sql, params).await;
        self.finish("query", sql, started);

        match &result {
            Ok(rows) => debug!("Query returned {} rows in {:?}", rows.len(), started.elapsed()),
            Err(e) => warn!("Query execution failed: {}", e),
        }
        result
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        self.log_query("statement", sql, params);
        let started = Instant::now();
        let result = self.inner.execute(sql, params).await;
        self.finish("statement", sql, started);

        match &result {
            Ok(affected) => debug!("Statement affected {} rows", affected),
            Err(e) => warn!("Statement execution failed: {}", e),
        }
        result
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.inner.begin().await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.inner.rollback().await
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }
}
