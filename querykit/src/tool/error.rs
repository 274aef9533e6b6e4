//! Database error taxonomy
//!
//! Every failure surfaced by the connection, transaction, retry and cache
//! layers is a [`DbError`]. Failures are tagged as retryable or not so the
//! retry controller never masks a programming error as a transient fault.

use thiserror::Error;
use tracing::{error, info, warn};

/// 공통 데이터베이스 에러 정의
///
/// `Clone` is required: a failed cache computation is delivered to every
/// waiter on the same key.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    /// Connection could not be acquired or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Transient data-access failure (lock contention, deadlock).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Permanent query failure (syntax, unknown table, constraint).
    #[error("query failed: {0}")]
    Query(String),

    /// Malformed input supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A transactional unit of work failed and was rolled back.
    #[error("transaction rolled back: {cause}")]
    Transaction { cause: Box<DbError> },

    /// All permitted attempts failed.
    #[error("operation '{operation}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<DbError>,
    },

    /// External cancellation observed between attempts.
    #[error("operation '{operation}' cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DbError {
    /// Wrap a failure raised inside a transaction.
    pub fn transaction(cause: DbError) -> Self {
        DbError::Transaction {
            cause: Box::new(cause),
        }
    }

    /// Whether a later attempt could plausibly succeed.
    ///
    /// A transaction failure inherits the classification of its cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Connection(_) | DbError::Transient(_) | DbError::Timeout(_) => true,
            DbError::Transaction { cause } => cause.is_retryable(),
            DbError::Query(_)
            | DbError::InvalidInput(_)
            | DbError::RetryExhausted { .. }
            | DbError::Cancelled { .. }
            | DbError::Configuration(_) => false,
        }
    }

    /// The innermost failure, looking through transaction and retry wrappers.
    pub fn root_cause(&self) -> &DbError {
        match self {
            DbError::Transaction { cause } => cause.root_cause(),
            DbError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// 에러의 심각도를 반환합니다.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DbError::Connection(_) | DbError::Configuration(_) => ErrorSeverity::Critical,
            DbError::Query(_) | DbError::RetryExhausted { .. } => ErrorSeverity::High,
            DbError::Transaction { cause } => match cause.severity() {
                ErrorSeverity::Low => ErrorSeverity::Medium,
                other => other,
            },
            DbError::InvalidInput(_) | DbError::Timeout(_) => ErrorSeverity::Medium,
            DbError::Transient(_) | DbError::Cancelled { .. } => ErrorSeverity::Low,
        }
    }

    /// 심각도에 따라 적절한 로깅 레벨을 사용합니다.
    pub fn log(&self, context: &str) {
        match self.severity() {
            ErrorSeverity::Critical => error!("[CRITICAL] {} - {}", context, self),
            ErrorSeverity::High => error!("[HIGH] {} - {}", context, self),
            ErrorSeverity::Medium => warn!("[MEDIUM] {} - {}", context, self),
            ErrorSeverity::Low => info!("[LOW] {} - {}", context, self),
        }
    }
}

/// 에러 심각도 레벨
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical, // 시스템 장애
    High,     // 쿼리 실패
    Medium,   // 입력 오류
    Low,      // 일시적 장애
}

/// MySQL error codes that signal lock contention rather than a bad statement.
const MYSQL_DEADLOCK: &str = "1213";
const MYSQL_LOCK_WAIT_TIMEOUT: &str = "1205";
const MYSQL_DEADLOCK_STATE: &str = "40001";

// SqlxError conversion
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                let message = db_err.message().to_string();
                if code == MYSQL_DEADLOCK
                    || code == MYSQL_LOCK_WAIT_TIMEOUT
                    || code == MYSQL_DEADLOCK_STATE
                    || message.contains("Deadlock")
                    || message.contains("Lock wait timeout")
                {
                    DbError::Transient(message)
                } else {
                    DbError::Query(message)
                }
            }
            sqlx::Error::Io(io_err) => DbError::Connection(io_err.to_string()),
            sqlx::Error::Tls(tls_err) => DbError::Connection(tls_err.to_string()),
            sqlx::Error::PoolTimedOut => {
                DbError::Timeout("database connection pool timeout".to_string())
            }
            sqlx::Error::PoolClosed => {
                DbError::Connection("database pool is closed".to_string())
            }
            sqlx::Error::Configuration(e) => DbError::Configuration(e.to_string()),
            sqlx::Error::RowNotFound => DbError::Query("database record not found".to_string()),
            other => DbError::Query(other.to_string()),
        }
    }
}
