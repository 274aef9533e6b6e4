//! Core database service modules
//!
//! Connection scope, transactions, retry and the query cache, each usable on its own.

pub mod cache;
pub mod config;
pub mod connection;
pub mod executor;
pub mod retry;
pub mod transaction;
pub mod types;

pub use cache::QueryCache;
pub use config::{CacheConfig, DbServiceConfig, PoolConfig, QueryConfig, RetryConfig};
pub use connection::{Connection, ConnectionManager, ConnectionSource, OpFuture};
pub use executor::LoggedConnection;
pub use retry::{with_retry, RetryPolicy, RETRY_OPT};
pub use transaction::{with_transaction, with_transaction_isolated, IsolationLevel};
pub use types::*;
