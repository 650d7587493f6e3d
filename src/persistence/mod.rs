//! SQLite persistence for strategies, orders and bracket links.
//!
//! Persists everything the loops need to survive restarts:
//! - Strategy definitions and last-run timestamps
//! - Scheduled orders (entries and TP/SL legs)
//! - Bracket links grouping entry + TP + SL
//! - Strategy leases (run mutual exclusion across processes)
//! - Review queue for unrecognized exchange statuses
//!
//! ## Locking contract
//!
//! Every write runs in its own `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front. Inside a transaction that touches more than
//! one row, the bracket link row is written first and its scheduled orders
//! after it, in ascending id order. Busy/locked conflicts are retried with
//! jittered backoff before surfacing as [`StoreError`].
//!
//! The connection is shared behind a mutex and only touched from blocking
//! worker threads, so async callers never hold it across an await.

mod brackets;
mod leases;

use crate::config::StoreConfig;
use crate::strategy::{RiskSettings, Strategy};
use crate::utils::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use brackets::ClosureRecord;
pub use leases::ReviewItem;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("connection mutex poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Lock contention worth retrying.
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Handle to the SQLite database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    write_retry: RetryPolicy,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(%journal_mode, "Journal mode set");

        let store = Self::from_connection(conn, config.write_retry_policy())?;
        info!("Store initialized at {:?}", path.as_ref());
        Ok(store)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, RetryPolicy::immediate(3))
    }

    fn from_connection(conn: Connection, write_retry: RetryPolicy) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_retry,
        })
    }

    /// Run a read-only closure on a blocking thread.
    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, retrying on contention.
    async fn write<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&Transaction<'_>) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        retry_with_backoff(&self.write_retry, operation, StoreError::is_conflict, |_| {
            let conn = self.conn.clone();
            let f = f.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })
                .await
                .map_err(|e| StoreError::Join(e.to_string()))?
            }
        })
        .await
    }

    /// Run one raw statement, for tests that need rows the API never writes.
    #[cfg(test)]
    pub(crate) async fn execute_sql(&self, sql: &str) -> Result<usize, StoreError> {
        let sql = sql.to_string();
        self.write("execute_sql", move |tx| Ok(tx.execute(&sql, [])?))
            .await
    }

    // ==================== Strategies ====================

    /// Insert or replace a strategy definition, keeping its last-run time.
    pub async fn upsert_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let strategy = strategy.clone();
        self.write("upsert_strategy", move |tx| {
            let symbols = serde_json::to_string(&strategy.symbols)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let risk = serde_json::to_string(&strategy.risk)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            tx.execute(
                r#"
                INSERT INTO strategies (id, kind, symbols, params, enabled, interval_secs, risk)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    kind = ?2,
                    symbols = ?3,
                    params = ?4,
                    enabled = ?5,
                    interval_secs = ?6,
                    risk = ?7
                "#,
                params![
                    strategy.id,
                    strategy.kind,
                    symbols,
                    strategy.params.to_string(),
                    strategy.enabled,
                    strategy.interval_secs as i64,
                    risk,
                ],
            )?;
            Ok(())
        })
        .await?;
        debug!("Strategy upserted");
        Ok(())
    }

    pub async fn get_strategy(&self, strategy_id: &str) -> Result<Option<Strategy>, StoreError> {
        let strategy_id = strategy_id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", SELECT_STRATEGY),
                params![strategy_id],
                strategy_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn list_enabled_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("{} WHERE enabled = 1 ORDER BY id", SELECT_STRATEGY))?;
            let strategies = stmt
                .query_map([], strategy_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(strategies)
        })
        .await
    }

    pub async fn touch_last_run(
        &self,
        strategy_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let strategy_id = strategy_id.to_string();
        self.write("touch_last_run", move |tx| {
            tx.execute(
                "UPDATE strategies SET last_run_at = ?2 WHERE id = ?1",
                params![strategy_id, at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

const SELECT_STRATEGY: &str = r#"
    SELECT id, kind, symbols, params, enabled, interval_secs, risk, last_run_at
    FROM strategies
"#;

fn strategy_from_row(row: &Row<'_>) -> rusqlite::Result<Strategy> {
    let risk: RiskSettings = json_col(row, 6)?;
    Ok(Strategy {
        id: row.get(0)?,
        kind: row.get(1)?,
        symbols: json_col(row, 2)?,
        params: json_col(row, 3)?,
        enabled: row.get(4)?,
        interval_secs: row.get::<_, i64>(5)?.max(0) as u64,
        risk,
        last_run_at: opt_time_col(row, 7)?,
    })
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS strategies (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            symbols TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            interval_secs INTEGER NOT NULL,
            risk TEXT NOT NULL,
            last_run_at TEXT
        );

        CREATE TABLE IF NOT EXISTS scheduled_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_id TEXT NOT NULL,
            group_id TEXT,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            kind TEXT NOT NULL,
            quantity TEXT NOT NULL,
            price TEXT,
            client_order_id TEXT NOT NULL UNIQUE,
            exchange_order_id TEXT,
            status TEXT NOT NULL,
            executed_qty TEXT NOT NULL DEFAULT '0',
            avg_price TEXT,
            parent_order_id INTEGER REFERENCES scheduled_orders(id),
            trigger_time TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_group ON scheduled_orders(group_id);
        CREATE INDEX IF NOT EXISTS idx_orders_symbol ON scheduled_orders(symbol, status);

        CREATE TABLE IF NOT EXISTS bracket_links (
            group_id TEXT PRIMARY KEY,
            strategy_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            entry_client_id TEXT NOT NULL,
            tp_client_id TEXT NOT NULL,
            sl_client_id TEXT NOT NULL,
            status TEXT NOT NULL,
            closed_leg TEXT,
            close_reason TEXT,
            sibling_cancel_error TEXT,
            created_at TEXT NOT NULL,
            closed_at TEXT,
            closing_owner TEXT,
            closing_started_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_links_status ON bracket_links(status);

        CREATE TABLE IF NOT EXISTS strategy_leases (
            strategy_id TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS review_queue (
            client_id TEXT PRIMARY KEY,
            group_id TEXT,
            raw_status TEXT NOT NULL,
            occurrences INTEGER NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            escalated INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    debug!("Database schema initialized");
    Ok(())
}

// ==================== Column helpers ====================

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unexpected value {:?}", raw)))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_time_sql(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339())
}

fn opt_decimal_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}
