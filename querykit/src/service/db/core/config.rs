//! 데이터베이스 서비스 설정 모듈
//!
//! 빌더 패턴으로 데이터베이스 서비스 설정을 관리

use crate::config::db::DbConfig;
use crate::service::db::core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// 데이터베이스 서비스 설정
#[derive(Debug, Clone)]
pub struct DbServiceConfig {
    /// 기본 데이터베이스 설정
    pub db_config: DbConfig,

    /// 쿼리 실행 설정
    pub query_config: QueryConfig,

    /// 연결 풀 설정
    pub pool_config: PoolConfig,

    /// 재시도 설정
    pub retry_config: RetryConfig,

    /// 쿼리 캐시 설정
    pub cache_config: CacheConfig,
}

/// 쿼리 실행 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// 쿼리 로깅 활성화
    pub enable_query_logging: bool,

    /// 느린 쿼리 로깅 (임계값: ms)
    pub slow_query_threshold_ms: u64,
}

/// 연결 풀 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 풀의 최소 연결 수
    pub min_connections: u32,

    /// 풀의 최대 연결 수
    pub max_connections: u32,

    /// 연결 타임아웃
    pub connect_timeout: Duration,

    /// 유휴 연결 타임아웃
    pub idle_timeout: Duration,
}

/// Retry controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub delay: Duration,

    /// Multiplier applied to the delay after each failed attempt (1.0 = fixed)
    pub backoff: f64,

    /// Upper bound of random jitter added to every delay
    pub jitter: Duration,
}

/// Query cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Route reads through the query cache
    pub enabled: bool,
}

impl DbServiceConfig {
    /// Create new configuration from environment
    pub fn from_env() -> Result<Self, crate::tool::error::DbError> {
        let db_config = DbConfig::from_env()?;
        Ok(Self::new(db_config).with_retry_config(RetryConfig::from_env()))
    }

    /// Create new configuration with defaults
    pub fn new(db_config: DbConfig) -> Self {
        Self {
            db_config,
            query_config: QueryConfig::default(),
            pool_config: PoolConfig::default(),
            retry_config: RetryConfig::default(),
            cache_config: CacheConfig::default(),
        }
    }

    /// Builder method for query configuration
    pub fn with_query_config(mut self, config: QueryConfig) -> Self {
        self.query_config = config;
        self
    }

    /// Builder method for pool configuration
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Builder method for retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Builder method for cache configuration
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }
}

impl RetryConfig {
    /// Defaults overridden by `db_retry_attempts` and `db_retry_delay_ms`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = env::var("db_retry_attempts") {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => config.max_attempts = n,
                _ => warn!("db_retry_attempts '{}' 무시, 기본값 {} 사용", raw, config.max_attempts),
            }
        }

        if let Ok(raw) = env::var("db_retry_delay_ms") {
            match raw.parse::<u64>() {
                Ok(ms) => config.delay = Duration::from_millis(ms),
                Err(_) => warn!("db_retry_delay_ms '{}' 무시, 기본값 {:?} 사용", raw, config.delay),
            }
        }

        config
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: self.delay,
            backoff: self.backoff,
            jitter: self.jitter,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enable_query_logging: true,
            slow_query_threshold_ms: 1000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1.0,
            jitter: Duration::ZERO,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
