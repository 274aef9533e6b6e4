//! Prometheus 메트릭 수집
//!
//! Process-wide counters for connections, transactions, retries and the query cache.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, Encoder, HistogramVec, IntCounter, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // 연결 메트릭
    pub static ref CONNECTIONS_ACQUIRED: IntCounter = register_int_counter!(
        "querykit_connections_acquired_total",
        "Total number of connections acquired"
    )
    .expect("Failed to register connections acquired counter");

    pub static ref CONNECTION_ERRORS: IntCounter = register_int_counter!(
        "querykit_connection_errors_total",
        "Total number of failed connection acquisitions"
    )
    .expect("Failed to register connection errors counter");

    // 트랜잭션 메트릭
    pub static ref TRANSACTION_COMMITS: IntCounter = register_int_counter!(
        "querykit_transaction_commits_total",
        "Total number of committed transactions"
    )
    .expect("Failed to register transaction commits counter");

    pub static ref TRANSACTION_ROLLBACKS: IntCounter = register_int_counter!(
        "querykit_transaction_rollbacks_total",
        "Total number of rolled back transactions"
    )
    .expect("Failed to register transaction rollbacks counter");

    // 재시도 메트릭
    pub static ref RETRY_ATTEMPTS: IntCounter = register_int_counter!(
        "querykit_retry_attempts_total",
        "Total number of retries scheduled after a retryable failure"
    )
    .expect("Failed to register retry attempts counter");

    pub static ref RETRIES_EXHAUSTED: IntCounter = register_int_counter!(
        "querykit_retries_exhausted_total",
        "Total number of operations that ran out of attempts"
    )
    .expect("Failed to register retries exhausted counter");

    // 캐시 메트릭
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "querykit_cache_hits_total",
        "Total number of query cache hits"
    )
    .expect("Failed to register cache hits counter");

    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "querykit_cache_misses_total",
        "Total number of query cache misses"
    )
    .expect("Failed to register cache misses counter");

    pub static ref CACHE_COALESCED: IntCounter = register_int_counter!(
        "querykit_cache_coalesced_total",
        "Total number of callers that waited on an in-flight query"
    )
    .expect("Failed to register cache coalesced counter");

    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "querykit_query_duration_seconds",
        "Statement execution time in seconds",
        &["kind"]
    )
    .expect("Failed to register query duration histogram");
}

/// 메트릭 헬퍼 함수들
pub struct Metrics;

impl Metrics {
    /// 쿼리 실행 시간 기록
    pub fn record_query(kind: &str, duration: Duration) {
        QUERY_DURATION
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Prometheus 메트릭을 텍스트 형식으로 수집
    pub fn gather_metrics() -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        CACHE_HITS.inc();
        RETRY_ATTEMPTS.inc();
        Metrics::record_query("query", Duration::from_millis(10));

        let metrics_text = Metrics::gather_metrics().expect("Failed to gather metrics");
        assert!(metrics_text.contains("querykit_cache_hits_total"));
        assert!(metrics_text.contains("querykit_retry_attempts_total"));
        assert!(metrics_text.contains("querykit_query_duration_seconds"));
    }
}
