//! MySQL backend over a sqlx connection pool.

use crate::config::db::DbConfig;
use crate::service::db::core::config::PoolConfig;
use crate::service::db::core::connection::{Connection, ConnectionSource};
use crate::service::db::core::types::{QueryRow, SqlValue};
use crate::tool::error::DbError;
use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, Executor, MySql, Row, TypeInfo};
use std::collections::HashMap;
use tracing::{debug, info};

/// Connection source backed by a `MySqlPool`. Releasing returns the
/// connection to the pool.
#[derive(Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig, pool_config: &PoolConfig) -> Result<Self, DbError> {
        Ok(Self::new(config.connect(pool_config).await?))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Gracefully close all connections
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

#[async_trait]
impl ConnectionSource for MySqlSource {
    async fn acquire(&self) -> Result<Box<dyn Connection>, DbError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DbError::Connection(format!("Connection pool exhausted: {}", e)))?;
        Ok(Box::new(MySqlSession {
            conn,
            in_transaction: false,
        }))
    }

    async fn release(&self, conn: Box<dyn Connection>) {
        // PoolConnection returns itself to the pool on drop.
        drop(conn);
    }

    fn name(&self) -> &str {
        "mysql"
    }
}

pub struct MySqlSession {
    conn: PoolConnection<MySql>,
    in_transaction: bool,
}

impl MySqlSession {
    /// Transaction control runs over the text protocol.
    async fn control(&mut self, statement: &str) -> Result<(), DbError> {
        (&mut *self.conn).execute(statement).await?;
        debug!("{} issued", statement);
        Ok(())
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<QueryRow>, DbError> {
        let rows = build_query(sql, params).fetch_all(&mut *self.conn).await?;
        rows.iter().map(row_to_map).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let result = build_query(sql, params).execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Err(DbError::Query("transaction already open".to_string()));
        }
        self.control("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        // A failed COMMIT leaves nothing to roll back on the server.
        self.in_transaction = false;
        self.control("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.in_transaction = false;
        self.control("ROLLBACK").await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

/// Build parameterized query
fn build_query<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, MySql, MySqlArguments> {
    let mut query_builder = sqlx::query(sql);

    for value in params {
        query_builder = match value {
            SqlValue::Null => query_builder.bind(Option::<String>::None),
            SqlValue::Bool(b) => query_builder.bind(*b),
            SqlValue::Int(i) => query_builder.bind(*i),
            SqlValue::Float(f) => query_builder.bind(*f),
            SqlValue::Text(s) => query_builder.bind(s.clone()),
            SqlValue::Bytes(b) => query_builder.bind(b.clone()),
        };
    }

    query_builder
}

/// Convert database row to HashMap
fn row_to_map(row: &MySqlRow) -> Result<QueryRow, DbError> {
    let mut result = HashMap::new();

    for column in row.columns() {
        let name = column.name();

        let value = match column.type_info().name() {
            "INT" | "BIGINT" | "SMALLINT" | "MEDIUMINT" | "TINYINT" => {
                decode::<i64>(row, name)?.map(serde_json::Value::from)
            }
            "INT UNSIGNED" | "BIGINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED"
            | "TINYINT UNSIGNED" => decode::<u64>(row, name)?.map(serde_json::Value::from),
            "BOOLEAN" | "BOOL" => decode::<bool>(row, name)?.map(serde_json::Value::Bool),
            "FLOAT" | "DOUBLE" => decode::<f64>(row, name)?
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number),
            "DATETIME" | "TIMESTAMP" => decode::<chrono::NaiveDateTime>(row, name)?
                .map(|v| serde_json::Value::String(v.to_string())),
            "DATE" => decode::<chrono::NaiveDate>(row, name)?
                .map(|v| serde_json::Value::String(v.to_string())),
            "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "VARBINARY" | "BINARY" => {
                decode::<Vec<u8>>(row, name)?.map(|bytes| SqlValue::Bytes(bytes).to_json())
            }
            // VARCHAR, TEXT, CHAR, DECIMAL and anything else read as text
            _ => row
                .try_get_unchecked::<Option<String>, _>(name)
                .map_err(|e| decode_error(name, e))?
                .map(serde_json::Value::String),
        };

        result.insert(name.to_string(), value.unwrap_or(serde_json::Value::Null));
    }

    Ok(result)
}

/// Typed column read; NULL is `None`, anything undecodable is an error.
fn decode<'r, T>(row: &'r MySqlRow, name: &str) -> Result<Option<T>, DbError>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get::<Option<T>, _>(name)
        .map_err(|e| decode_error(name, e))
}

fn decode_error(column: &str, err: sqlx::Error) -> DbError {
    DbError::Query(format!("failed to decode column '{}': {}", column, err))
}
