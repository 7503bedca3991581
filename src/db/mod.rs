// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store handle shared by repositories, the id generator and the
//! SQL sync store.
//!
//! One [`Database`] wraps an sqlx `AnyPool` so the same code runs against the
//! on-site SQLite file and the cloud PostgreSQL instance. The handle is
//! passed explicitly (through [`TenantContext`](crate::tenant::TenantContext)
//! holders and the repositories); there is no process-wide session.
//!
//! ## sqlx Any driver quirks
//!
//! - Placeholders are `$N`, which both SQLite and PostgreSQL accept.
//! - Booleans are stored as BIGINT 0/1 and money as DOUBLE PRECISION/REAL;
//!   the Any driver cannot decode NUMERIC and does not coerce SQLite
//!   integers into `bool`.
//! - JSON blobs (permissions) are TEXT.
//! - Timestamps are epoch milliseconds in BIGINT columns.

pub mod query;
pub mod schema;

use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use std::sync::{Arc, Once};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

use crate::resilience::retry::{retry, RetryConfig};
use query::{ColumnKind, SqlParam};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Unique constraint violated on '{field}'")]
    Unique { field: String },
    #[error("Foreign key violated: {0}")]
    ForeignKey(String),
    #[error("Unknown column '{column}' in '{table}'")]
    Incompatible { table: String, column: String },
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            sqlx::Error::Database(db) => {
                let message = db.message();
                match db.kind() {
                    ErrorKind::UniqueViolation => StorageError::Unique {
                        field: unique_field(message, db.constraint()),
                    },
                    ErrorKind::ForeignKeyViolation => StorageError::ForeignKey(message.to_string()),
                    _ => {
                        if let Some(column) = unknown_column(message, db.code().as_deref()) {
                            StorageError::Incompatible { table: String::new(), column }
                        } else if message.contains("database is locked") || message.contains("database is busy") {
                            StorageError::Unavailable(message.to_string())
                        } else {
                            StorageError::Backend(message.to_string())
                        }
                    }
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// Offending column from a unique-violation report.
///
/// SQLite: `UNIQUE constraint failed: patients.display_id`.
/// PostgreSQL: constraint `patients_display_id_key` / `users_pkey`.
fn unique_field(message: &str, constraint: Option<&str>) -> String {
    if let Some(rest) = message.split("constraint failed: ").nth(1) {
        let first = rest.split(',').next().unwrap_or(rest).trim();
        return first.rsplit('.').next().unwrap_or(first).to_string();
    }
    if let Some(name) = constraint {
        if name.ends_with("_pkey") {
            return "id".into();
        }
        let name = name.trim_end_matches("_key");
        for table in schema::TABLE_NAMES {
            if let Some(col) = name.strip_prefix(table).and_then(|s| s.strip_prefix('_')) {
                return col.to_string();
            }
        }
        return name.to_string();
    }
    "unknown".into()
}

/// SQLite: `table patients has no column named foo` / `no such column: foo`.
/// PostgreSQL 42703: `column "foo" of relation "patients" does not exist`.
fn unknown_column(message: &str, code: Option<&str>) -> Option<String> {
    if let Some(rest) = message.split("has no column named ").nth(1) {
        return Some(rest.trim().to_string());
    }
    if let Some(rest) = message.split("no such column: ").nth(1) {
        return Some(rest.trim().to_string());
    }
    if code == Some("42703") {
        return message.split('"').nth(1).map(str::to_string);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite:") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        }
    }
}

/// Shared handle to one relational store.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
    label: Arc<str>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("label", &self.label)
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl Database {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// bring the schema up to date.
    #[instrument(skip(url), fields(dialect))]
    pub async fn connect(label: &str, url: &str) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = Dialect::from_url(url);
        tracing::Span::current().record("dialect", tracing::field::debug(dialect));
        let started = std::time::Instant::now();

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if dialect == Dialect::Sqlite { 8 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(url)
                .await
                .map_err(StorageError::from)
        })
        .await
        .inspect_err(|_| crate::metrics::record_connection_error(label))?;

        let db = Self { pool, dialect, label: Arc::from(label) };

        if dialect == Dialect::Sqlite {
            db.enable_wal_mode().await?;
        }

        retry("sql_init_schema", &RetryConfig::startup(), || schema::apply(&db)).await?;

        crate::metrics::set_backend_healthy(label, true);
        crate::metrics::record_startup_phase("db_connect", started.elapsed());
        info!(label, ?dialect, "database ready");
        Ok(db)
    }

    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Readers don't block the single writer; NORMAL sync is safe under WAL.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    /// Run a read with quick retries on transient failures only.
    pub(crate) async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<AnyRow>, StorageError> {
        crate::resilience::retry::retry_when(
            "sql_read",
            &RetryConfig::query(),
            StorageError::is_transient,
            || async { bind_all(sqlx::query(sql), params).fetch_all(&self.pool).await.map_err(StorageError::from) },
        )
        .await
    }

    pub(crate) async fn fetch_optional(&self, sql: &str, params: &[SqlParam]) -> Result<Option<AnyRow>, StorageError> {
        crate::resilience::retry::retry_when(
            "sql_read",
            &RetryConfig::query(),
            StorageError::is_transient,
            || async { bind_all(sqlx::query(sql), params).fetch_optional(&self.pool).await.map_err(StorageError::from) },
        )
        .await
    }

    /// Writes are not retried here; a lost ack could otherwise double-apply.
    pub(crate) async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, StorageError> {
        let done = bind_all(sqlx::query(sql), params).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    pub(crate) async fn write_returning(&self, sql: &str, params: &[SqlParam]) -> Result<Option<AnyRow>, StorageError> {
        Ok(bind_all(sqlx::query(sql), params).fetch_optional(&self.pool).await?)
    }
}

/// Bind dynamic parameters in order.
pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlParam],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Real(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Blob(v) => query.bind(v.clone()),
            SqlParam::Null(ColumnKind::Int) => query.bind(None::<i64>),
            SqlParam::Null(ColumnKind::Real) => query.bind(None::<f64>),
            SqlParam::Null(ColumnKind::Text) => query.bind(None::<String>),
            SqlParam::Null(ColumnKind::Blob) => query.bind(None::<Vec<u8>>),
        };
    }
    query
}

/// Current wall clock in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Next `updated_at` for a row last stamped at `previous`: wall clock, but
/// never equal to or behind the previous stamp.
#[must_use]
pub fn next_stamp(previous: i64) -> i64 {
    now_millis().max(previous.saturating_add(1))
}

// Row readers. TEXT may surface as bytes on some drivers, so try both.

pub(crate) fn text(row: &AnyRow, col: &str) -> Result<String, StorageError> {
    opt_text(row, col)?.ok_or_else(|| StorageError::Backend(format!("column '{col}' is NULL")))
}

pub(crate) fn opt_text(row: &AnyRow, col: &str) -> Result<Option<String>, StorageError> {
    match row.try_get::<Option<String>, _>(col) {
        Ok(v) => Ok(v),
        Err(_) => row
            .try_get::<Option<Vec<u8>>, _>(col)
            .map(|bytes| bytes.and_then(|b| String::from_utf8(b).ok()))
            .map_err(StorageError::from),
    }
}

pub(crate) fn int(row: &AnyRow, col: &str) -> Result<i64, StorageError> {
    Ok(row.try_get::<i64, _>(col)?)
}

pub(crate) fn opt_int(row: &AnyRow, col: &str) -> Result<Option<i64>, StorageError> {
    Ok(row.try_get::<Option<i64>, _>(col)?)
}

pub(crate) fn real(row: &AnyRow, col: &str) -> Result<f64, StorageError> {
    match row.try_get::<f64, _>(col) {
        Ok(v) => Ok(v),
        // SQLite hands back whole-number REALs written as integers
        Err(_) => Ok(row.try_get::<i64, _>(col)? as f64),
    }
}

pub(crate) fn opt_real(row: &AnyRow, col: &str) -> Result<Option<f64>, StorageError> {
    match row.try_get::<Option<f64>, _>(col) {
        Ok(v) => Ok(v),
        Err(_) => Ok(row.try_get::<Option<i64>, _>(col)?.map(|v| v as f64)),
    }
}

pub(crate) fn flag(row: &AnyRow, col: &str) -> Result<bool, StorageError> {
    Ok(int(row, col)? != 0)
}
