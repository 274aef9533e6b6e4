//! End-to-end behaviour of the composed primitives against the in-memory backend.

use futures::future::join_all;
use querykit::service::db::{
    with_retry, with_transaction, ConnectionManager, MemoryDatabase, QueryCache, QueryPipeline,
    RetryPolicy, SqlValue,
};
use querykit::DbError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const ALL_USERS: &str = "SELECT * FROM users";

fn seeded() -> MemoryDatabase {
    MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com"), (2, "Bob", "bob@example.com")])
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_users_fetched_once_then_served_from_cache() {
        let db = seeded();
        let manager = ConnectionManager::new(Arc::new(db.clone()));
        let cache = Arc::new(QueryCache::new());

        let mut results = Vec::new();
        for _ in 0..2 {
            let cache = cache.clone();
            let rows = manager
                .with_connection(move |conn| {
                    Box::pin(async move { cache.cached_query(conn, ALL_USERS, &[]).await })
                })
                .await
                .unwrap();
            results.push(rows);
        }

        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert_eq!(results[0][0]["name"], serde_json::json!("Ann"));
        assert_eq!(db.stats().queries, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let db = seeded();
        db.set_latency(Duration::from_millis(50));
        let pipeline = QueryPipeline::builder(Arc::new(db.clone()))
            .cache(Arc::new(QueryCache::new()))
            .build();

        let callers = (0..16).map(|_| pipeline.read("fetch_users", ALL_USERS, &[]));
        let results = join_all(callers).await;

        let first = results[0].as_ref().unwrap().clone();
        for result in &results {
            let rows = result.as_ref().unwrap();
            assert!(Arc::ptr_eq(rows, &first));
            assert_eq!(rows.len(), 2);
        }
        assert_eq!(db.stats().queries, 1);
        assert_eq!(db.stats().opened, 16);
        assert_eq!(db.stats().closed, 16);
        assert_eq!(pipeline.cache().unwrap().stats().coalesced, 15);
    }

    #[tokio::test]
    async fn test_non_retryable_query_error_not_retried_or_cached() {
        let db = seeded();
        let pipeline = QueryPipeline::builder(Arc::new(db.clone()))
            .cache(Arc::new(QueryCache::new()))
            .retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .build();

        let err = assert_err!(pipeline.read("fetch_orders", "SELECT * FROM orders", &[]).await);

        assert!(matches!(err, DbError::Query(_)));
        assert_eq!(db.stats().queries, 1);
        assert!(pipeline.cache().unwrap().is_empty());
    }
}

#[cfg(test)]
mod transaction_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_unit_of_work_leaves_no_partial_writes() {
        let db = seeded();
        let manager = ConnectionManager::new(Arc::new(db.clone()));

        let err = manager
            .with_connection(|conn| {
                Box::pin(async move {
                    with_transaction(conn, |tx| {
                        Box::pin(async move {
                            tx.execute(
                                "UPDATE users SET email = ? WHERE id = ?",
                                &[SqlValue::from("ann@new.example.com"), SqlValue::Int(1)],
                            )
                            .await?;
                            tx.execute("DELETE FROM users WHERE id = ?", &[SqlValue::Int(2)])
                                .await?;
                            Err::<(), _>(DbError::InvalidInput("email rejected".into()))
                        })
                    })
                    .await
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.root_cause(), &DbError::InvalidInput("email rejected".into()));
        assert!(matches!(err, DbError::Transaction { .. }));

        let rows = db.rows("users");
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|row| row["email"] == serde_json::json!("ann@example.com")));
        let stats = db.stats();
        assert_eq!((stats.commits, stats.rollbacks), (0, 1));
        assert_eq!(stats.opened, stats.closed);
    }

    #[tokio::test]
    async fn test_pipeline_write_commits_and_is_visible() {
        let db = seeded();
        let pipeline = QueryPipeline::builder(Arc::new(db.clone())).build();

        pipeline
            .write("update_user_email", |conn| {
                Box::pin(async move {
                    conn.execute(
                        "UPDATE users SET email = ? WHERE id = ?",
                        &[SqlValue::from("crawford@example.com"), SqlValue::Int(1)],
                    )
                    .await
                })
            })
            .await
            .unwrap();

        let rows = assert_ok!(
            pipeline
                .read_fresh("get_user_by_id", "SELECT * FROM users WHERE id = ?", &[SqlValue::Int(1)])
                .await
        );
        assert_eq!(rows[0]["email"], serde_json::json!("crawford@example.com"));
        assert_eq!(db.stats().commits, 1);
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_connection_attempts_exactly_three_times() {
        let db = seeded();
        db.fail_next_acquire(u32::MAX);
        let pipeline = QueryPipeline::builder(Arc::new(db.clone())).build();

        let err = pipeline.read("fetch_users", ALL_USERS, &[]).await.unwrap_err();

        match err {
            DbError::RetryExhausted {
                operation,
                attempts,
                last,
            } => {
                assert_eq!(operation, "fetch_users");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DbError::Connection(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.stats().opened, 0);
        assert_eq!(pipeline.connection_stats().connection_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_attempts() {
        let db = seeded();
        db.fail_next_queries(100, DbError::Transient("lock wait timeout".into()));
        let token = CancellationToken::new();
        let pipeline = QueryPipeline::builder(Arc::new(db.clone()))
            .retry(RetryPolicy::new(10, Duration::from_secs(1)))
            .cancellation(token.clone())
            .build();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = pipeline
            .write("update_user_email", |conn| {
                Box::pin(async move {
                    conn.execute(
                        "UPDATE users SET email = ? WHERE id = ?",
                        &[SqlValue::from("x@example.com"), SqlValue::Int(1)],
                    )
                    .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Cancelled { attempts: 3, .. }));
        let stats = db.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 3);
        assert_eq!(stats.opened, stats.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_operation_is_not_retried() {
        let db = seeded();
        let token = CancellationToken::new();
        let pipeline = QueryPipeline::builder(Arc::new(db.clone()))
            .retry(RetryPolicy::new(3, Duration::from_secs(1)))
            .cancellation(token.clone())
            .build();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = pipeline
            .write("update_user_email", |conn| {
                Box::pin(async move {
                    let affected = conn
                        .execute(
                            "UPDATE users SET email = ? WHERE id = ?",
                            &[SqlValue::from("x@example.com"), SqlValue::Int(1)],
                        )
                        .await?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(affected)
                })
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DbError::Cancelled {
                operation: "update_user_email".into(),
                attempts: 1
            }
        );
        let stats = db.stats();
        assert_eq!((stats.commits, stats.rollbacks), (0, 1));
        assert_eq!((stats.opened, stats.closed), (1, 1));
        assert_eq!(db.rows("users")[0]["email"], serde_json::json!("ann@example.com"));
    }

    #[tokio::test]
    async fn test_manual_nesting_retry_outside_connection() {
        let db = seeded();
        db.fail_next_acquire(1);
        let manager = ConnectionManager::new(Arc::new(db.clone()));
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let rows = with_retry(
            &RetryPolicy::new(3, Duration::from_millis(1)),
            "fetch_users_with_retry",
            &token,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                manager.with_connection(|conn| {
                    Box::pin(async move { conn.fetch_all(ALL_USERS, &[]).await })
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(db.stats().opened, 1);
    }
}

#[cfg(test)]
mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_operation_releases_and_rolls_back() {
        let db = seeded();
        db.set_latency(Duration::from_millis(200));
        let manager = ConnectionManager::new(Arc::new(db.clone()));
        let token = CancellationToken::new();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager
            .with_connection_cancellable(&token, |conn| {
                Box::pin(async move {
                    with_transaction(conn, |tx| {
                        Box::pin(async move {
                            tx.execute("DELETE FROM users", &[]).await?;
                            Ok(())
                        })
                    })
                    .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Cancelled { .. }));
        assert_eq!(db.row_count("users"), 2);
        let stats = db.stats();
        assert_eq!((stats.opened, stats.closed), (1, 1));
        assert_eq!((stats.commits, stats.rollbacks), (0, 1));
    }
}
