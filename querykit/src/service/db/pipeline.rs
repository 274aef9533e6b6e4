//! Explicit composition of the query primitives.
//!
//! Reads run as `retry( connection( cache( query ) ) )`, writes as
//! `retry( connection( transaction( op ) ) )`. The order is fixed here so call
//! sites never depend on how wrappers happen to be stacked.

use crate::service::db::core::cache::QueryCache;
use crate::service::db::core::config::{DbServiceConfig, QueryConfig};
use crate::service::db::core::connection::{ConnectionManager, ConnectionSource, OpFuture};
use crate::service::db::core::retry::{with_retry, RetryPolicy};
use crate::service::db::core::transaction::with_transaction;
use crate::service::db::core::types::{ConnectionStats, ResultSet, SqlValue};
use crate::service::db::core::Connection;
use crate::tool::error::DbError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Composed query entry point, built with [`QueryPipeline::builder`].
#[derive(Clone)]
pub struct QueryPipeline {
    connections: ConnectionManager,
    cache: Option<Arc<QueryCache>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

pub struct QueryPipelineBuilder {
    source: Arc<dyn ConnectionSource>,
    cache: Option<Arc<QueryCache>>,
    retry: RetryPolicy,
    query_config: QueryConfig,
    cancel: CancellationToken,
}

impl QueryPipelineBuilder {
    /// Serve reads through `cache`.
    pub fn cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn query_config(mut self, config: QueryConfig) -> Self {
        self.query_config = config;
        self
    }

    /// Token observed between retry attempts and while an operation runs.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> QueryPipeline {
        debug!(
            "Query pipeline on {}: cache={}, max_attempts={}",
            self.source.name(),
            self.cache.is_some(),
            self.retry.max_attempts
        );
        QueryPipeline {
            connections: ConnectionManager::with_query_config(self.source, self.query_config),
            cache: self.cache,
            retry: self.retry,
            cancel: self.cancel,
        }
    }
}

impl QueryPipeline {
    pub fn builder(source: Arc<dyn ConnectionSource>) -> QueryPipelineBuilder {
        QueryPipelineBuilder {
            source,
            cache: None,
            retry: RetryPolicy::default(),
            query_config: QueryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builder preloaded from service configuration. A fresh cache is attached
    /// when caching is enabled.
    pub fn from_config(source: Arc<dyn ConnectionSource>, config: &DbServiceConfig) -> QueryPipelineBuilder {
        let builder = Self::builder(source)
            .retry(config.retry_config.policy())
            .query_config(config.query_config.clone());
        if config.cache_config.enabled {
            builder.cache(Arc::new(QueryCache::new()))
        } else {
            builder
        }
    }

    /// Cached read: `retry( connection( cache( query ) ) )`.
    pub async fn read(
        &self,
        operation_name: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ResultSet, DbError> {
        with_retry(&self.retry, operation_name, &self.cancel, || async move {
            let cache = self.cache.clone();
            let sql = sql.to_string();
            let params = params.to_vec();

            self.connections
                .with_connection_cancellable(&self.cancel, move |conn| {
                    Box::pin(async move {
                        match cache {
                            Some(cache) => cache.cached_query(conn, &sql, &params).await,
                            None => conn.fetch_all(&sql, &params).await.map(Arc::new),
                        }
                    })
                })
                .await
        })
        .await
    }

    /// Uncached read that always reaches the database.
    pub async fn read_fresh(
        &self,
        operation_name: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ResultSet, DbError> {
        with_retry(&self.retry, operation_name, &self.cancel, || async move {
            let sql = sql.to_string();
            let params = params.to_vec();

            self.connections
                .with_connection_cancellable(&self.cancel, move |conn| {
                    Box::pin(async move { conn.fetch_all(&sql, &params).await.map(Arc::new) })
                })
                .await
        })
        .await
    }

    /// Transactional write: `retry( connection( transaction( op ) ) )`.
    ///
    /// `operation` is cloned for every attempt; each attempt runs in its own
    /// transaction on its own connection.
    pub async fn write<T, F>(&self, operation_name: &str, operation: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send + Sync + Clone + 'static,
        T: Send,
    {
        with_retry(&self.retry, operation_name, &self.cancel, || {
            let op = operation.clone();
            self.connections.with_connection_cancellable(&self.cancel, move |conn| {
                Box::pin(async move { with_transaction(conn, op).await })
            })
        })
        .await
    }

    /// Non-transactional unit of work: `retry( connection( op ) )`.
    pub async fn run<T, F>(&self, operation_name: &str, operation: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> OpFuture<'c, T> + Send + Sync + Clone + 'static,
        T: Send,
    {
        with_retry(&self.retry, operation_name, &self.cancel, || {
            self.connections
                .with_connection_cancellable(&self.cancel, operation.clone())
        })
        .await
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connections.stats()
    }
}
