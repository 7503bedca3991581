// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::table::SyncTable;
use crate::config::CoreConfig;

/// A replicated row as column → value. Stores decode by declared column
/// kind; columns a store doesn't know travel as whatever they decode to.
pub type SyncRecord = serde_json::Map<String, Value>;

/// Keyset position `(updated_at, id)` in a table's change stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Cursor {
    pub updated_at: i64,
    pub id: i64,
}

impl Cursor {
    pub const EPOCH: Cursor = Cursor { updated_at: 0, id: 0 };

    /// Everything stamped strictly after `millis`.
    #[must_use]
    pub fn after_time(millis: i64) -> Self {
        Self { updated_at: millis, id: i64::MAX }
    }

    #[must_use]
    pub fn of(record: &SyncRecord) -> Option<Self> {
        Some(Self {
            updated_at: record_int(record, "updated_at")?,
            id: record_int(record, "id")?,
        })
    }
}

/// Persisted per `(clinic, table)` in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub cursor: Cursor,
    pub last_synced_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Start from the epoch cursor.
    Full,
    /// Start from the persisted cursor.
    Incremental,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassOutcome {
    Completed,
    /// Ran, but hit the deadline or left errors behind.
    Partial,
    /// The peer could not be reached; nothing was exchanged.
    Unavailable,
}

impl PassOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PassOutcome::Completed => "completed",
            PassOutcome::Partial => "partial",
            PassOutcome::Unavailable => "unavailable",
        }
    }
}

/// What one table pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSyncReport {
    pub table: SyncTable,
    pub outcome: PassOutcome,
    pub pulled: usize,
    pub pushed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    pub deadline_hit: bool,
}

impl TableSyncReport {
    #[must_use]
    pub fn new(table: SyncTable) -> Self {
        Self {
            table,
            outcome: PassOutcome::Completed,
            pulled: 0,
            pushed: 0,
            skipped: 0,
            conflicts: 0,
            errors: Vec::new(),
            deadline_hit: false,
        }
    }

    pub(crate) fn unavailable(&mut self, reason: impl Into<String>) {
        self.outcome = PassOutcome::Unavailable;
        self.errors.push(reason.into());
    }

    /// Settle the outcome from what was recorded, unless already unavailable.
    pub(crate) fn settle(&mut self) {
        if self.outcome != PassOutcome::Unavailable && (self.deadline_hit || !self.errors.is_empty()) {
            self.outcome = PassOutcome::Partial;
        }
    }

    /// Error text for the status view, if any.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTotals {
    pub pulled: usize,
    pub pushed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub unavailable: usize,
}

impl SyncTotals {
    pub(crate) fn add(&mut self, report: &TableSyncReport) {
        self.pulled += report.pulled;
        self.pushed += report.pushed;
        self.skipped += report.skipped;
        self.conflicts += report.conflicts;
        self.errors += report.errors.len();
        if report.outcome == PassOutcome::Unavailable {
            self.unavailable += 1;
        }
    }
}

/// Result of a pass over every replicated table.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub mode: SyncMode,
    pub clinic_id: i64,
    pub tables: Vec<TableSyncReport>,
    pub totals: SyncTotals,
}

impl SyncReport {
    /// True when every table completed without errors.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.tables.iter().all(|t| t.outcome == PassOutcome::Completed)
    }
}

/// Row counts by sync marker for one `(clinic, table)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub synced: u64,
    pub pending: u64,
    pub conflicts: u64,
}

/// One table in `GET /sync/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatus {
    /// Peer time of the last clean pass
    pub last_synced_at: Option<i64>,
    /// A clean pass has run, nothing is pending and the last pass had no error
    pub synced: bool,
    pub synced_rows: u64,
    pub pending: u64,
    pub conflicts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableStatus {
    #[must_use]
    pub fn new(last_synced_at: Option<i64>, counts: SyncCounts, error: Option<String>) -> Self {
        Self {
            last_synced_at,
            synced: last_synced_at.is_some() && counts.pending == 0 && error.is_none(),
            synced_rows: counts.synced,
            pending: counts.pending,
            conflicts: counts.conflicts,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusReport {
    pub clinic_id: i64,
    pub tables: std::collections::BTreeMap<String, TableStatus>,
}

/// Knobs the coordinator reads at the start of every pass. Updated at
/// runtime through the settings watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub table_timeout: Duration,
    pub interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

impl SyncSettings {
    #[must_use]
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            batch_size: config.sync_batch_size.max(1),
            table_timeout: config.sync_table_timeout(),
            interval: config.sync_interval(),
        }
    }
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background loop not started
    Created,
    /// Background loop waiting for the next tick
    Running,
    /// Background loop inside a tick
    Syncing,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Syncing => write!(f, "Syncing"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

pub(crate) fn record_int(record: &SyncRecord, column: &str) -> Option<i64> {
    match record.get(column)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn record_text<'a>(record: &'a SyncRecord, column: &str) -> Option<&'a str> {
    record.get(column).and_then(Value::as_str)
}
