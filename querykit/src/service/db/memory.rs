//! In-memory database backend
//!
//! A process-local stand-in for MySQL used by tests and the demo binary.
//! It understands a small statement subset:
//!
//! - `CREATE TABLE [IF NOT EXISTS] t (...)`
//! - `SELECT * FROM t [WHERE col = ?]`
//! - `INSERT INTO t (a, b) VALUES (?, ?)`
//! - `UPDATE t SET a = ?[, b = ?] [WHERE col = ?]`
//! - `DELETE FROM t [WHERE col = ?]`
//! - `SET ...` session statements (accepted, no effect)
//!
//! Transactions read and write a private snapshot of all tables and record
//! their writes. Commit replays those writes onto the current shared tables,
//! so concurrent transactions on other connections are not lost. Rollback
//! discards both. Faults can be
//! injected per acquisition, per statement and per commit.

use crate::service::db::core::connection::{Connection, ConnectionSource};
use crate::service::db::core::types::{QueryRow, SqlValue};
use crate::tool::error::DbError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<QueryRow>,
    next_id: i64,
}

type Tables = HashMap<String, Table>;

/// Open transaction on one connection.
struct PendingTransaction {
    tables: Tables,
    writes: Vec<(Statement, Vec<SqlValue>)>,
}

#[derive(Default)]
struct State {
    tables: Tables,
    acquire_failures: u32,
    query_failures: VecDeque<DbError>,
    commit_failure: Option<DbError>,
    latency: Duration,
    stats: MemoryStats,
}

/// Counters observed by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub opened: u64,
    pub closed: u64,
    pub queries: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// Shared handle to one in-memory database. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database with a `users (id, name, email)` table holding `users`.
    pub fn with_users(users: &[(i64, &str, &str)]) -> Self {
        let db = Self::new();
        db.create_table("users");
        for (id, name, email) in users {
            let mut row = QueryRow::new();
            row.insert("id".to_string(), serde_json::json!(id));
            row.insert("name".to_string(), serde_json::json!(name));
            row.insert("email".to_string(), serde_json::json!(email));
            db.insert_row("users", row);
        }
        db
    }

    pub fn create_table(&self, table: &str) {
        self.state.lock().tables.entry(table.to_string()).or_insert_with(|| Table {
            rows: Vec::new(),
            next_id: 1,
        });
    }

    /// Insert a committed row directly, bypassing statements and counters.
    pub fn insert_row(&self, table: &str, row: QueryRow) {
        let mut state = self.state.lock();
        let table = state.tables.entry(table.to_string()).or_insert_with(|| Table {
            rows: Vec::new(),
            next_id: 1,
        });
        push_row(table, row);
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<QueryRow> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// The next `count` acquisitions fail with a connection error.
    pub fn fail_next_acquire(&self, count: u32) {
        self.state.lock().acquire_failures = count;
    }

    /// The next `count` statements fail with `error`.
    pub fn fail_next_queries(&self, count: usize, error: DbError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.query_failures.push_back(error.clone());
        }
    }

    /// The next commit fails with `error`; the transaction is discarded.
    pub fn fail_next_commit(&self, error: DbError) {
        self.state.lock().commit_failure = Some(error);
    }

    /// Delay applied to every statement before it runs.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }

    /// Run one statement against either the shared tables or an open transaction.
    fn run(
        &self,
        transaction: Option<&mut PendingTransaction>,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<StatementResult, DbError> {
        let mut state = self.state.lock();
        state.stats.queries += 1;
        if let Some(err) = state.query_failures.pop_front() {
            return Err(err);
        }

        let statement = Statement::parse(sql)?;
        match transaction {
            Some(tx) => {
                let result = statement.apply(&mut tx.tables, params)?;
                if statement.is_write() {
                    tx.writes.push((statement, params.to_vec()));
                }
                Ok(result)
            }
            None => statement.apply(&mut state.tables, params),
        }
    }
}

#[async_trait]
impl ConnectionSource for MemoryDatabase {
    async fn acquire(&self) -> Result<Box<dyn Connection>, DbError> {
        let mut state = self.state.lock();
        if state.acquire_failures > 0 {
            state.acquire_failures -= 1;
            return Err(DbError::Connection("unable to open database file".to_string()));
        }
        state.stats.opened += 1;
        let id = state.stats.opened;
        debug!("memory connection {} opened", id);

        Ok(Box::new(MemoryConnection {
            db: self.clone(),
            transaction: None,
            id,
        }))
    }

    async fn release(&self, conn: Box<dyn Connection>) {
        drop(conn);
        let mut state = self.state.lock();
        state.stats.closed += 1;
        debug!("memory connection closed ({} total)", state.stats.closed);
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Session on a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: MemoryDatabase,
    transaction: Option<PendingTransaction>,
    id: u64,
}

impl MemoryConnection {
    async fn statement(&mut self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, DbError> {
        let latency = self.db.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.db.run(self.transaction.as_mut(), sql, params)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<QueryRow>, DbError> {
        match self.statement(sql, params).await? {
            StatementResult::Rows(rows) => Ok(rows),
            StatementResult::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        match self.statement(sql, params).await? {
            StatementResult::Rows(rows) => Ok(rows.len() as u64),
            StatementResult::Affected(n) => Ok(n),
        }
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        if self.transaction.is_some() {
            return Err(DbError::Query("transaction already open".to_string()));
        }
        self.transaction = Some(PendingTransaction {
            tables: self.db.state.lock().tables.clone(),
            writes: Vec::new(),
        });
        debug!("memory connection {} began transaction", self.id);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| DbError::Query("no transaction to commit".to_string()))?;

        let mut state = self.db.state.lock();
        if let Some(err) = state.commit_failure.take() {
            return Err(err);
        }

        // 커밋 시점의 테이블에 쓰기 재적용
        let mut tables = state.tables.clone();
        for (statement, params) in &tx.writes {
            statement.apply(&mut tables, params)?;
        }
        state.tables = tables;
        state.stats.commits += 1;
        debug!(
            "memory connection {} committed {} write(s)",
            self.id,
            tx.writes.len()
        );
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if self.transaction.take().is_none() {
            return Err(DbError::Query("no transaction to roll back".to_string()));
        }
        self.db.state.lock().stats.rollbacks += 1;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

enum StatementResult {
    Rows(Vec<QueryRow>),
    Affected(u64),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    CreateTable { table: String },
    Select { table: String, filter: Option<String> },
    Insert { table: String, columns: Vec<String> },
    Update { table: String, assignments: Vec<String>, filter: Option<String> },
    Delete { table: String, filter: Option<String> },
    Session,
}

impl Statement {
    fn is_write(&self) -> bool {
        !matches!(self, Statement::Select { .. } | Statement::Session)
    }

    fn parse(sql: &str) -> Result<Self, DbError> {
        let normalized = sql
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let normalized = normalized.trim_end_matches(';').trim();

        if strip_keyword(normalized, "SET ").is_some() {
            return Ok(Statement::Session);
        }

        if let Some(rest) = strip_keyword(normalized, "CREATE TABLE ") {
            let rest = strip_keyword(rest, "IF NOT EXISTS ").unwrap_or(rest);
            let table = identifier(rest.split(|c: char| c == '(' || c == ' ').next().unwrap_or(""))?;
            return Ok(Statement::CreateTable { table });
        }

        if let Some(rest) = strip_keyword(normalized, "SELECT * FROM ") {
            let (table, filter) = split_where(rest)?;
            return Ok(Statement::Select {
                table: identifier(table)?,
                filter,
            });
        }

        if let Some(rest) = strip_keyword(normalized, "INSERT INTO ") {
            let open = rest.find('(').ok_or_else(|| syntax_error(sql))?;
            let close = rest.find(')').ok_or_else(|| syntax_error(sql))?;
            if close < open {
                return Err(syntax_error(sql));
            }
            let table = identifier(&rest[..open])?;
            let columns = rest[open + 1..close]
                .split(',')
                .map(identifier)
                .collect::<Result<Vec<_>, _>>()?;
            let values = strip_keyword(rest[close + 1..].trim(), "VALUES").ok_or_else(|| syntax_error(sql))?;
            if values.matches('?').count() != columns.len() {
                return Err(syntax_error(sql));
            }
            return Ok(Statement::Insert { table, columns });
        }

        if let Some(rest) = strip_keyword(normalized, "UPDATE ") {
            let (table, body) = rest.split_once(' ').ok_or_else(|| syntax_error(sql))?;
            let body = strip_keyword(body, "SET ").ok_or_else(|| syntax_error(sql))?;
            let (assignments, filter) = split_where(body)?;
            let assignments = assignments
                .split(',')
                .map(placeholder_column)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Statement::Update {
                table: identifier(table)?,
                assignments,
                filter,
            });
        }

        if let Some(rest) = strip_keyword(normalized, "DELETE FROM ") {
            let (table, filter) = split_where(rest)?;
            return Ok(Statement::Delete {
                table: identifier(table)?,
                filter,
            });
        }

        Err(DbError::Query(format!("unsupported statement: {}", sql)))
    }

    fn placeholders(&self) -> usize {
        let filter = |f: &Option<String>| usize::from(f.is_some());
        match self {
            Statement::CreateTable { .. } | Statement::Session => 0,
            Statement::Select { filter: f, .. } | Statement::Delete { filter: f, .. } => filter(f),
            Statement::Insert { columns, .. } => columns.len(),
            Statement::Update {
                assignments,
                filter: f,
                ..
            } => assignments.len() + filter(f),
        }
    }

    fn apply(&self, tables: &mut Tables, params: &[SqlValue]) -> Result<StatementResult, DbError> {
        if params.len() != self.placeholders() {
            return Err(DbError::InvalidInput(format!(
                "expected {} parameters, got {}",
                self.placeholders(),
                params.len()
            )));
        }

        match self {
            Statement::Session => Ok(StatementResult::Affected(0)),
            Statement::CreateTable { table } => {
                tables.entry(table.clone()).or_insert_with(|| Table {
                    rows: Vec::new(),
                    next_id: 1,
                });
                Ok(StatementResult::Affected(0))
            }
            Statement::Select { table, filter } => {
                let table = lookup(tables, table)?;
                let rows = table
                    .rows
                    .iter()
                    .filter(|row| matches_filter(row, filter.as_deref(), params.first()))
                    .cloned()
                    .collect();
                Ok(StatementResult::Rows(rows))
            }
            Statement::Insert { table, columns } => {
                let table = lookup(tables, table)?;
                let row = columns
                    .iter()
                    .cloned()
                    .zip(params.iter().map(SqlValue::to_json))
                    .collect();
                push_row(table, row);
                Ok(StatementResult::Affected(1))
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                let table = lookup(tables, table)?;
                let (values, condition) = params.split_at(assignments.len());
                let mut affected = 0;
                for row in table
                    .rows
                    .iter_mut()
                    .filter(|row| matches_filter(row, filter.as_deref(), condition.first()))
                {
                    for (column, value) in assignments.iter().zip(values) {
                        row.insert(column.clone(), value.to_json());
                    }
                    affected += 1;
                }
                Ok(StatementResult::Affected(affected))
            }
            Statement::Delete { table, filter } => {
                let table = lookup(tables, table)?;
                let before = table.rows.len();
                table
                    .rows
                    .retain(|row| !matches_filter(row, filter.as_deref(), params.first()));
                Ok(StatementResult::Affected((before - table.rows.len()) as u64))
            }
        }
    }
}

fn push_row(table: &mut Table, mut row: QueryRow) {
    match row.get("id").and_then(serde_json::Value::as_i64) {
        Some(id) => table.next_id = table.next_id.max(id + 1),
        None => {
            row.insert("id".to_string(), serde_json::json!(table.next_id));
            table.next_id += 1;
        }
    }
    table.rows.push(row);
}

fn lookup<'a>(tables: &'a mut Tables, table: &str) -> Result<&'a mut Table, DbError> {
    tables
        .get_mut(table)
        .ok_or_else(|| DbError::Query(format!("no such table: {}", table)))
}

fn matches_filter(row: &QueryRow, column: Option<&str>, value: Option<&SqlValue>) -> bool {
    match (column, value) {
        (Some(column), Some(value)) => row.get(column) == Some(&value.to_json()),
        _ => true,
    }
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| s[keyword.len()..].trim_start())
}

/// Split `"<head> WHERE col = ?"` into head and filter column.
fn split_where(s: &str) -> Result<(&str, Option<String>), DbError> {
    match s.to_ascii_uppercase().find(" WHERE ") {
        Some(idx) => {
            let condition = &s[idx + " WHERE ".len()..];
            Ok((s[..idx].trim(), Some(placeholder_column(condition)?)))
        }
        None => Ok((s.trim(), None)),
    }
}

/// Parse `"col = ?"` into `col`.
fn placeholder_column(s: &str) -> Result<String, DbError> {
    let (column, value) = s
        .split_once('=')
        .ok_or_else(|| DbError::Query(format!("expected 'column = ?', got '{}'", s.trim())))?;
    if value.trim() != "?" {
        return Err(DbError::Query(format!(
            "only placeholder comparisons are supported: '{}'",
            s.trim()
        )));
    }
    identifier(column)
}

fn identifier(s: &str) -> Result<String, DbError> {
    let s = s.trim().trim_matches('`');
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(s.to_string())
    } else {
        Err(DbError::Query(format!("invalid identifier: '{}'", s)))
    }
}

fn syntax_error(sql: &str) -> DbError {
    DbError::Query(format!("syntax error near: {}", sql))
}
