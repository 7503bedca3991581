// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Human-readable medical identifiers: `MRN-2025-00042`.
//!
//! # Algorithm
//!
//! ```text
//! seed (once per prefix/year)   INSERT id_sequences ... ON CONFLICT DO NOTHING
//!                                 last_value = max suffix already in the table
//! claim                          UPDATE id_sequences SET last_value = last_value + 1
//!                                 ... RETURNING last_value
//! verify                         candidate absent from owning table?
//!   yes → insert row
//!   no  → raise sequence to observed max, back off, claim again
//! ```
//!
//! The sequence row makes concurrent issuers on one store serialize on a
//! single autocommit UPDATE. The verify step covers rows that arrived by
//! sync from another store using the same sequence space.

use chrono::{Datelike, Local};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::db::{self, Database};
use crate::error::{CoreError, CoreResult};
use crate::resilience::retry::{retry_when, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Patient,
    Payment,
    Report,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [RecordType::Patient, RecordType::Payment, RecordType::Report];

    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            RecordType::Patient => "MRN",
            RecordType::Payment => "INV",
            RecordType::Report => "RAD",
        }
    }

    /// Table whose `display_id` column holds this type's identifiers.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            RecordType::Patient => "patients",
            RecordType::Payment => "payments",
            RecordType::Report => "reports",
        }
    }

    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.prefix() == prefix)
    }
}

/// Parsed `PREFIX-YYYY-NNNNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId {
    pub record: RecordType,
    pub year: i32,
    pub seq: u64,
}

impl DisplayId {
    #[must_use]
    pub fn new(record: RecordType, year: i32, seq: u64) -> Self {
        Self { record, year, seq }
    }

    /// Strict parse: only the canonical form [`fmt::Display`] emits.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, '-');
        let record = RecordType::from_prefix(parts.next()?)?;
        let year = parts.next()?;
        let seq = parts.next()?;

        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if seq.len() < 5 || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let parsed = Self { record, year: year.parse().ok()?, seq: seq.parse().ok()? };
        (parsed.seq > 0 && parsed.to_string() == value).then_some(parsed)
    }

    /// `PREFIX-YYYY-`, the LIKE stem for a year's identifiers.
    #[must_use]
    pub fn stem(record: RecordType, year: i32) -> String {
        format!("{}-{year:04}-", record.prefix())
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}-{:05}", self.record.prefix(), self.year, self.seq)
    }
}

impl Serialize for DisplayId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Issues display ids from the `id_sequences` table.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    db: Database,
    max_attempts: usize,
    seeded: Arc<DashSet<(RecordType, i32)>>,
}

impl IdGenerator {
    #[must_use]
    pub fn new(db: Database, max_attempts: usize) -> Self {
        Self { db, max_attempts: max_attempts.max(1), seeded: Arc::new(DashSet::new()) }
    }

    /// Current year in the server's local timezone.
    #[must_use]
    pub fn current_year() -> i32 {
        Local::now().year()
    }

    /// Claim the next identifier that is not yet present in the owning table.
    pub async fn next(&self, record: RecordType, year: Option<i32>) -> CoreResult<DisplayId> {
        let year = year.unwrap_or_else(Self::current_year);
        self.ensure_seeded(record, year).await?;

        let result = retry_when(
            "display_id",
            &RetryConfig::id_generation(self.max_attempts),
            |e: &CoreError| matches!(e, CoreError::Conflict { .. } | CoreError::Unavailable(_)),
            || self.claim(record, year),
        )
        .await;

        self.finish(record, year, result)
    }

    /// Issue an identifier and run `insert` with it. A unique violation on
    /// `display_id` (a row with that id landed between verify and insert)
    /// raises the sequence and tries again with a fresh identifier.
    pub async fn issue<F, Fut, T>(&self, record: RecordType, mut insert: F) -> CoreResult<T>
    where
        F: FnMut(DisplayId) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let year = Self::current_year();
        self.ensure_seeded(record, year).await?;
        let backoff = RetryConfig::id_generation(self.max_attempts);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.claim(record, year).await {
                Ok(id) => insert(id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Err(CoreError::Conflict { field }) if field == "display_id" => {
                    if attempt >= self.max_attempts {
                        return self.finish(record, year, Err(CoreError::Conflict { field }));
                    }
                    crate::metrics::record_id_retry(record.prefix());
                    self.raise_to_observed(record, year).await?;
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                }
                other => return self.finish(record, year, other),
            }
        }
    }

    fn finish<T>(&self, record: RecordType, year: i32, result: CoreResult<T>) -> CoreResult<T> {
        match result {
            Ok(v) => {
                crate::metrics::record_id_issued(record.prefix());
                Ok(v)
            }
            Err(CoreError::Conflict { field }) if field == "display_id" => {
                error!(prefix = record.prefix(), year, attempts = self.max_attempts, "display id attempts exhausted");
                Err(CoreError::IdExhausted { prefix: record.prefix(), year })
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_seeded(&self, record: RecordType, year: i32) -> CoreResult<()> {
        if self.seeded.contains(&(record, year)) {
            return Ok(());
        }
        let observed = self.max_existing(record, year).await?;
        self.db
            .execute(
                "INSERT INTO id_sequences (prefix, year, last_value) VALUES ($1, $2, $3)
                 ON CONFLICT (prefix, year) DO NOTHING",
                &[record.prefix().into(), i64::from(year).into(), (observed as i64).into()],
            )
            .await?;
        self.seeded.insert((record, year));
        debug!(prefix = record.prefix(), year, observed, "id sequence seeded");
        Ok(())
    }

    /// One claim attempt: bump the sequence, then verify the candidate.
    async fn claim(&self, record: RecordType, year: i32) -> CoreResult<DisplayId> {
        let row = self
            .db
            .write_returning(
                "UPDATE id_sequences SET last_value = last_value + 1
                 WHERE prefix = $1 AND year = $2 RETURNING last_value",
                &[record.prefix().into(), i64::from(year).into()],
            )
            .await?
            .ok_or_else(|| CoreError::Internal(format!("id sequence {}-{year} missing", record.prefix())))?;
        let seq = db::int(&row, "last_value")?;
        let candidate = DisplayId::new(record, year, seq.max(1) as u64);

        let taken = self
            .db
            .fetch_optional(
                &format!("SELECT id FROM {} WHERE display_id = $1", record.table()),
                &[candidate.to_string().into()],
            )
            .await?
            .is_some();

        if taken {
            warn!(candidate = %candidate, "display id already present, raising sequence");
            crate::metrics::record_id_retry(record.prefix());
            self.raise_to_observed(record, year).await?;
            return Err(CoreError::Conflict { field: "display_id".into() });
        }
        Ok(candidate)
    }

    async fn raise_to_observed(&self, record: RecordType, year: i32) -> CoreResult<()> {
        let observed = self.max_existing(record, year).await? as i64;
        self.db
            .execute(
                "UPDATE id_sequences SET last_value = $3
                 WHERE prefix = $1 AND year = $2 AND last_value < $3",
                &[record.prefix().into(), i64::from(year).into(), observed.into()],
            )
            .await?;
        Ok(())
    }

    /// Highest suffix present for `(record, year)`. Canonical ids sort by
    /// length, then lexically, so the first one that parses is the maximum.
    /// Legacy or hand-entered ids sharing the stem are skipped.
    async fn max_existing(&self, record: RecordType, year: i32) -> CoreResult<u64> {
        let stem = DisplayId::stem(record, year);
        let sql = format!(
            "SELECT display_id FROM {} WHERE display_id LIKE $1 AND LENGTH(display_id) >= $2
             ORDER BY LENGTH(display_id) DESC, display_id DESC",
            record.table()
        );
        let min_len = (stem.len() + 5) as i64;
        let rows = self.db.fetch_all(&sql, &[format!("{stem}%").into(), min_len.into()]).await?;
        for row in &rows {
            if let Some(id) = DisplayId::parse(&db::text(row, "display_id")?) {
                return Ok(id.seq);
            }
        }
        Ok(0)
    }
}
