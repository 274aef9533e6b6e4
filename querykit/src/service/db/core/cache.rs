//! Query result cache
//!
//! Memoizes read results per (query text, parameters). Each key moves through
//! `absent -> computing -> populated`; callers arriving while a key is
//! computing wait for that computation instead of running the query again.
//! Entries never expire: freshness is the caller's call via `invalidate`/`clear`.

use crate::monitoring::metrics;
use crate::service::db::core::connection::Connection;
use crate::service::db::core::types::{CacheStats, QueryKey, ResultSet, SqlValue};
use crate::tool::error::DbError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Outcome = Option<Result<ResultSet, DbError>>;

enum Slot {
    Ready(ResultSet),
    Computing(watch::Receiver<Outcome>),
}

enum Lookup {
    Hit(ResultSet),
    Wait(watch::Receiver<Outcome>),
    Lead(watch::Sender<Outcome>),
}

/// Connection-independent query cache, owned by the application and shared by `Arc`.
#[derive(Default)]
pub struct QueryCache {
    entries: DashMap<QueryKey, Slot>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached rows for `(sql, params)`, running the query on `conn`
    /// only when no result exists and no other caller is computing one.
    ///
    /// A failed query is not cached; callers that were waiting on it receive
    /// the same failure.
    pub async fn cached_query(
        &self,
        conn: &mut dyn Connection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ResultSet, DbError> {
        let key = QueryKey::new(sql, params);

        loop {
            let lookup = match self.entries.entry(key.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Ready(rows) => Lookup::Hit(rows.clone()),
                    Slot::Computing(rx) => Lookup::Wait(rx.clone()),
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(Slot::Computing(rx));
                    Lookup::Lead(tx)
                }
            };

            match lookup {
                Lookup::Hit(rows) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::CACHE_HITS.inc();
                    info!("Cache hit! Returning cached result for query: '{}...'", key.preview());
                    return Ok(rows);
                }
                Lookup::Wait(mut rx) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    metrics::CACHE_COALESCED.inc();
                    debug!("Waiting on in-flight query: '{}...'", key.preview());

                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(result) => return result,
                        // Leader went away without a result; contend again.
                        None => continue,
                    }
                }
                Lookup::Lead(tx) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    metrics::CACHE_MISSES.inc();
                    info!("Cache miss. Executing query: '{}...'", key.preview());

                    let guard = ComputingGuard {
                        entries: &self.entries,
                        key: &key,
                        armed: true,
                    };
                    let result = conn.fetch_all(sql, params).await.map(Arc::new);

                    match &result {
                        Ok(rows) => {
                            self.entries.insert(key.clone(), Slot::Ready(rows.clone()));
                        }
                        Err(e) => {
                            self.failures.fetch_add(1, Ordering::Relaxed);
                            self.entries.remove(&key);
                            warn!("Query failed, not cached: '{}...': {}", key.preview(), e);
                        }
                    }
                    guard.disarm();

                    tx.send_replace(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Drop a populated entry. Returns whether one was present.
    pub fn invalidate(&self, sql: &str, params: &[SqlValue]) -> bool {
        let key = QueryKey::new(sql, params);
        self.entries
            .remove_if(&key, |_, slot| matches!(slot, Slot::Ready(_)))
            .is_some()
    }

    /// Drop every populated entry. In-flight computations are left alone.
    pub fn clear(&self) {
        self.entries.retain(|_, slot| matches!(slot, Slot::Computing(_)));
    }

    pub fn contains(&self, sql: &str, params: &[SqlValue]) -> bool {
        let key = QueryKey::new(sql, params);
        self.entries
            .get(&key)
            .map_or(false, |slot| matches!(*slot, Slot::Ready(_)))
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Returns a key to `absent` if its leader is dropped before finishing.
struct ComputingGuard<'a> {
    entries: &'a DashMap<QueryKey, Slot>,
    key: &'a QueryKey,
    armed: bool,
}

impl ComputingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entries
                .remove_if(self.key, |_, slot| matches!(slot, Slot::Computing(_)));
            debug!("Abandoned computation for '{}...'", self.key.preview());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::db::core::connection::{ConnectionManager, ConnectionSource};
    use crate::service::db::memory::MemoryDatabase;
    use std::time::Duration;

    const ALL_USERS: &str = "SELECT * FROM users";
    const USER_BY_ID: &str = "SELECT * FROM users WHERE id = ?";

    #[tokio::test]
    async fn test_second_call_is_a_hit_with_same_object() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let cache = QueryCache::new();
        let mut conn = db.acquire().await.unwrap();

        let first = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        let second = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        db.release(conn).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first[0]["name"], serde_json::json!("Ann"));
        assert_eq!(db.stats().queries, 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let db = MemoryDatabase::with_users(&[
            (1, "Ann", "ann@example.com"),
            (2, "Bob", "bob@example.com"),
        ]);
        let cache = QueryCache::new();
        let mut conn = db.acquire().await.unwrap();

        let one = cache
            .cached_query(conn.as_mut(), USER_BY_ID, &[SqlValue::Int(1)])
            .await
            .unwrap();
        let two = cache
            .cached_query(conn.as_mut(), USER_BY_ID, &[SqlValue::Int(2)])
            .await
            .unwrap();
        let all = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        db.release(conn).await;

        assert_eq!(one[0]["name"], serde_json::json!("Ann"));
        assert_eq!(two[0]["name"], serde_json::json!("Bob"));
        assert_eq!(all.len(), 2);
        assert_eq!(cache.len(), 3);
        assert_eq!(db.stats().queries, 3);

        assert!(cache.invalidate(USER_BY_ID, &[SqlValue::Int(1)]));
        assert!(!cache.contains(USER_BY_ID, &[SqlValue::Int(1)]));
        assert!(cache.contains(USER_BY_ID, &[SqlValue::Int(2)]));
    }

    #[tokio::test]
    async fn test_entries_survive_writes_until_invalidated() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        let cache = QueryCache::new();
        let mut conn = db.acquire().await.unwrap();

        cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        conn.execute("DELETE FROM users", &[]).await.unwrap();
        let stale = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        assert_eq!(stale.len(), 1);

        cache.clear();
        let fresh = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        db.release(conn).await;
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        db.fail_next_queries(1, DbError::Transient("database is locked".into()));
        let cache = QueryCache::new();
        let mut conn = db.acquire().await.unwrap();

        let err = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_empty());

        let rows = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        db.release(conn).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(cache.stats().failures, 1);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_waiters_receive_leader_failure() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        db.set_latency(Duration::from_millis(50));
        db.fail_next_queries(1, DbError::Query("no such column".into()));
        let cache = Arc::new(QueryCache::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let mut conn = db.acquire().await?;
                let result = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await;
                db.release(conn).await;
                result
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err, DbError::Query("no such column".into()));
        }
        assert_eq!(db.stats().queries, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_leader_returns_key_to_absent() {
        let db = MemoryDatabase::with_users(&[(1, "Ann", "ann@example.com")]);
        db.set_latency(Duration::from_millis(200));
        let cache = Arc::new(QueryCache::new());

        let leader = {
            let cache = cache.clone();
            let db = db.clone();
            tokio::spawn(async move {
                ConnectionManager::new(Arc::new(db))
                    .with_connection(move |conn| {
                        Box::pin(async move { cache.cached_query(conn, ALL_USERS, &[]).await })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        let _ = leader.await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(db.stats().opened, db.stats().closed);

        db.set_latency(Duration::ZERO);
        let mut conn = db.acquire().await.unwrap();
        let rows = cache.cached_query(conn.as_mut(), ALL_USERS, &[]).await.unwrap();
        db.release(conn).await;

        assert_eq!(rows.len(), 1);
        assert_eq!(cache.stats().misses, 2);
    }
}
