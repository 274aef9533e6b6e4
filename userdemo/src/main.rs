//! userdemo
//!
//! Drives the query pipeline through the users-table scenarios: table setup,
//! cached reads, a transactional email update and a retrying fetch.
//!
//! `db_backend=mysql` uses the MySQL settings from `.env`; anything else runs
//! against the in-memory database.

use anyhow::Result;
use querykit::logging::init_logging;
use querykit::monitoring::gather_metrics;
use querykit::service::db::{
    ConnectionSource, DbServiceConfig, MemoryDatabase, MySqlSource, QueryPipeline, SqlValue,
};
use std::env;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CREATE_USERS: &str = "CREATE TABLE IF NOT EXISTS users (\
    id INT AUTO_INCREMENT PRIMARY KEY, \
    name VARCHAR(255) NOT NULL, \
    email VARCHAR(255) NOT NULL)";
const ALL_USERS: &str = "SELECT * FROM users";
const USER_BY_ID: &str = "SELECT * FROM users WHERE id = ?";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info")?;

    let config = DbServiceConfig::from_env()?;
    let (source, mysql) = open_source(&config).await?;
    info!("userdemo 시작 (backend: {})", source.name());

    let pipeline = QueryPipeline::from_config(source.clone(), &config).build();
    info!("retry policy: {:?}", pipeline.retry_policy());

    // Ctrl+C 시 진행 중인 재시도 중단
    let shutdown = pipeline.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, cancelling in-flight operations");
            shutdown.cancel();
        }
    });

    setup_users(&pipeline).await?;

    // 같은 쿼리 두 번: 두 번째는 캐시에서
    let users = pipeline.read("fetch_users", ALL_USERS, &[]).await?;
    info!("{} users fetched", users.len());
    let again = pipeline.read("fetch_users", ALL_USERS, &[]).await?;
    info!("{} users fetched again (same result: {})", again.len(), Arc::ptr_eq(&users, &again));

    let user_id = users
        .first()
        .and_then(|row| row.get("id"))
        .and_then(|id| id.as_i64())
        .unwrap_or(1);

    update_user_email(&pipeline, user_id, "Crawford_Cartwright@hotmail.com").await?;

    let user = pipeline
        .read_fresh("get_user_by_id", USER_BY_ID, &[SqlValue::Int(user_id)])
        .await?;
    info!("user {}: {}", user_id, serde_json::to_string(&*user)?);

    let users = pipeline.read("fetch_users_with_retry", ALL_USERS, &[]).await?;
    info!("{} users after update", users.len());

    if let Some(cache) = pipeline.cache() {
        let stats = cache.stats();
        info!(
            "cache: entries={}, hits={}, misses={}, hit_rate={:.2}",
            stats.entries,
            stats.hits,
            stats.misses,
            stats.hit_rate()
        );
    }
    info!("connections: {:?}", pipeline.connection_stats());
    debug!("metrics:\n{}", gather_metrics()?);

    if let Some(mysql) = mysql {
        info!("MySQL pool size before close: {}", mysql.pool().size());
        mysql.close().await;
    }

    Ok(())
}

/// The pipeline's source, plus the MySQL handle when that backend is used so
/// its pool can be closed on exit.
async fn open_source(
    config: &DbServiceConfig,
) -> Result<(Arc<dyn ConnectionSource>, Option<MySqlSource>)> {
    let backend = env::var("db_backend").unwrap_or_else(|_| "memory".to_string());
    match backend.as_str() {
        "mysql" => {
            let db = &config.db_config;
            info!("MySQL backend: {}@{}:{}/{}", db.user, db.host, db.port, db.database);
            let source = MySqlSource::connect(&config.db_config, &config.pool_config).await?;
            Ok((Arc::new(source.clone()), Some(source)))
        }
        "memory" => Ok((Arc::new(MemoryDatabase::new()), None)),
        other => {
            warn!("알 수 없는 db_backend '{}', memory를 사용합니다.", other);
            Ok((Arc::new(MemoryDatabase::new()), None))
        }
    }
}

async fn setup_users(pipeline: &QueryPipeline) -> Result<()> {
    pipeline
        .run("create_users_table", |conn| {
            Box::pin(async move { conn.execute(CREATE_USERS, &[]).await })
        })
        .await?;

    let existing = pipeline.read_fresh("count_users", ALL_USERS, &[]).await?;
    if existing.is_empty() {
        let inserted = pipeline
            .write("seed_users", |conn| {
                Box::pin(async move {
                    let mut inserted = 0;
                    for (name, email) in [("Ann", "ann@example.com"), ("Bob", "bob@example.com")] {
                        inserted += conn
                            .execute(
                                "INSERT INTO users (name, email) VALUES (?, ?)",
                                &[SqlValue::from(name), SqlValue::from(email)],
                            )
                            .await?;
                    }
                    Ok(inserted)
                })
            })
            .await?;
        info!("{} users seeded", inserted);
    }
    Ok(())
}

async fn update_user_email(pipeline: &QueryPipeline, user_id: i64, new_email: &str) -> Result<()> {
    let email = new_email.to_string();
    let affected = pipeline
        .write("update_user_email", move |conn| {
            Box::pin(async move {
                conn.execute(
                    "UPDATE users SET email = ? WHERE id = ?",
                    &[SqlValue::Text(email), SqlValue::Int(user_id)],
                )
                .await
            })
        })
        .await?;
    info!("update_user_email: {} row(s) updated", affected);

    // 캐시는 스스로 무효화하지 않는다
    if let Some(cache) = pipeline.cache() {
        cache.invalidate(ALL_USERS, &[]);
    }
    Ok(())
}
