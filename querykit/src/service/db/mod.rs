//! 데이터베이스 서비스 모듈
//!
//! Query execution primitives and the backends they run on.

// 핵심 모듈들 - 관심사의 명확한 분리
pub mod core;
pub mod pipeline;

// 백엔드
pub mod memory;
pub mod mysql;

pub use self::core::{
    // 캐시
    cache::QueryCache,
    // 설정 관련
    config::{CacheConfig, DbServiceConfig, PoolConfig, QueryConfig, RetryConfig},
    // 연결 관리
    connection::{Connection, ConnectionManager, ConnectionSource, OpFuture},
    // 재시도
    retry::{with_retry, RetryPolicy},
    // 트랜잭션 관리
    transaction::{with_transaction, with_transaction_isolated, IsolationLevel},
    // 데이터 타입들
    types::{CacheStats, ConnectionStats, QueryKey, QueryRow, ResultSet, SqlValue},
};
pub use memory::{MemoryDatabase, MemoryStats};
pub use mysql::MySqlSource;
pub use pipeline::{QueryPipeline, QueryPipelineBuilder};
