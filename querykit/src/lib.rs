//! querykit
//!
//! Connection-scoped query cache with transactional retry.
//!
//! Four primitives compose by plain nesting (innermost runs first):
//! - [`ConnectionManager::with_connection`] acquires and always releases a connection
//! - [`with_transaction`] commits on success, rolls back on failure
//! - [`with_retry`] re-runs retryable failures with a bounded attempt budget
//! - [`QueryCache::cached_query`] memoizes read results per (query, params)
//!
//! [`QueryPipeline`] wires them in the canonical order so the nesting is
//! visible at the call site.

pub mod config;
pub mod logging;
pub mod monitoring;
pub mod service;
pub mod tool;

pub use service::db::{
    with_retry, with_transaction, CacheStats, Connection, ConnectionManager, ConnectionSource,
    ConnectionStats, QueryCache, QueryKey, QueryPipeline, QueryRow, ResultSet, RetryPolicy,
    SqlValue,
};
pub use tool::error::{DbError, ErrorSeverity};
