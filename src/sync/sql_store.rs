// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! [`SyncStore`] over a [`Database`] (SQLite or PostgreSQL).
//!
//! Rows are read with `SELECT *` so columns one replica has and the other
//! lacks show up and can be reported as incompatible. Values decode by the
//! column's declared kind; unknown columns decode as int, real or text,
//! whichever fits.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Column, Row};
use tracing::debug;

use super::store::SyncStore;
use super::table::SyncTable;
use super::types::{Checkpoint, Cursor, SyncCounts, SyncRecord};
use crate::db::query::{ColumnKind, SqlParam};
use crate::db::{self, Database, Dialect, StorageError};

#[derive(Debug, Clone)]
pub struct SqlSyncStore {
    db: Database,
}

impl SqlSyncStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    fn decode(table: SyncTable, row: &AnyRow) -> Result<SyncRecord, StorageError> {
        let mut record = SyncRecord::new();
        for column in row.columns() {
            let name = column.name();
            let value = match table.kind_of(name) {
                Some(ColumnKind::Int) => db::opt_int(row, name)?.map_or(Value::Null, Value::from),
                Some(ColumnKind::Real) => db::opt_real(row, name)?.map_or(Value::Null, Value::from),
                Some(ColumnKind::Text) => db::opt_text(row, name)?.map_or(Value::Null, Value::from),
                Some(ColumnKind::Blob) | None => decode_loose(row, name),
            };
            record.insert(name.to_string(), value);
        }
        Ok(record)
    }

    fn decode_all(table: SyncTable, rows: &[AnyRow]) -> Result<Vec<SyncRecord>, StorageError> {
        rows.iter().map(|r| Self::decode(table, r)).collect()
    }

    async fn scan(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
        extra: &str,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        let sql = format!(
            "SELECT * FROM {t} WHERE {tenant} = $1{extra} \
             AND (updated_at > $2 OR (updated_at = $2 AND id > $3)) \
             ORDER BY updated_at ASC, id ASC LIMIT {limit}",
            t = table.name(),
            tenant = table.tenant_column(),
        );
        let params = [clinic_id.into(), after.updated_at.into(), after.id.into()];
        let rows = self.db.fetch_all(&sql, &params).await?;
        Self::decode_all(table, &rows)
    }

    /// `INSERT .. ON CONFLICT(id) DO UPDATE` over the record's columns.
    /// With `guarded`, the update carries the last-writer-wins condition so
    /// the check and the write are one statement. Returns whether a row was
    /// written.
    async fn write(&self, table: SyncTable, record: &SyncRecord, guarded: bool) -> Result<bool, StorageError> {
        if !record.contains_key("id") {
            return Err(StorageError::Backend(format!("{table} record without id")));
        }
        if let Some(bad) = record.keys().find(|k| !is_identifier(k)) {
            return Err(StorageError::Incompatible { table: table.name().into(), column: bad.clone() });
        }

        let t = table.name();
        let columns: Vec<&str> = record.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != "id")
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else if guarded {
            format!(
                "DO UPDATE SET {} WHERE {t}.updated_at < excluded.updated_at \
                 OR ({t}.updated_at = excluded.updated_at AND {t}.sync_status = 'synced')",
                updates.join(", ")
            )
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {t} ({}) VALUES ({}) ON CONFLICT(id) {on_conflict}",
            columns.join(", "),
            placeholders.join(", "),
        );
        let params: Vec<SqlParam> = record.iter().map(|(c, v)| to_param(table.kind_of(c), v)).collect();

        match self.db.execute(&sql, &params).await {
            Ok(written) => Ok(written > 0),
            Err(StorageError::Incompatible { column, .. }) => {
                Err(StorageError::Incompatible { table: table.name().into(), column })
            }
            Err(e) => Err(e),
        }
    }
}

fn decode_loose(row: &AnyRow, name: &str) -> Value {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(name) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(name) {
        return Value::from(v);
    }
    match db::opt_text(row, name) {
        Ok(Some(v)) => Value::from(v),
        _ => Value::Null,
    }
}

/// Column names arrive from the other replica; only plain identifiers are
/// allowed into SQL text.
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
}

fn to_param(kind: Option<ColumnKind>, value: &Value) -> SqlParam {
    match (kind, value) {
        (Some(k), Value::Null) => SqlParam::Null(k),
        (None, Value::Null) => SqlParam::Null(ColumnKind::Text),
        (Some(ColumnKind::Real), Value::Number(n)) => SqlParam::Real(n.as_f64().unwrap_or_default()),
        (Some(ColumnKind::Int), Value::Number(n)) => {
            SqlParam::Int(n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or_default() as i64))
        }
        (_, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlParam::Int(i),
            None => SqlParam::Real(n.as_f64().unwrap_or_default()),
        },
        (_, Value::Bool(b)) => SqlParam::from(*b),
        (_, Value::String(s)) => SqlParam::Text(s.clone()),
        (_, other) => SqlParam::Text(other.to_string()),
    }
}

#[async_trait]
impl SyncStore for SqlSyncStore {
    fn label(&self) -> &str {
        self.db.label()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.db.ping().await
    }

    async fn server_time(&self) -> Result<i64, StorageError> {
        let sql = match self.db.dialect() {
            Dialect::Sqlite => "SELECT CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER) AS now",
            Dialect::Postgres => "SELECT CAST(EXTRACT(EPOCH FROM clock_timestamp()) * 1000 AS BIGINT) AS now",
        };
        let row = self.db.fetch_optional(sql, &[]).await?.ok_or(StorageError::NotFound)?;
        db::int(&row, "now")
    }

    async fn columns(&self, table: SyncTable) -> Result<Vec<String>, StorageError> {
        let (sql, params): (&str, Vec<SqlParam>) = match self.db.dialect() {
            Dialect::Sqlite => ("SELECT name FROM pragma_table_info($1)", vec![table.name().into()]),
            Dialect::Postgres => (
                "SELECT CAST(column_name AS TEXT) AS name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
                vec![table.name().into()],
            ),
        };
        let rows = self.db.fetch_all(sql, &params).await?;
        rows.iter().map(|r| db::text(r, "name")).collect()
    }

    async fn fetch_changed(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        self.scan(table, clinic_id, after, limit, "").await
    }

    async fn fetch_pending(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        self.scan(table, clinic_id, after, limit, " AND sync_status = 'local'").await
    }

    async fn get(&self, table: SyncTable, id: i64) -> Result<Option<SyncRecord>, StorageError> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", table.name());
        match self.db.fetch_optional(&sql, &[id.into()]).await? {
            Some(row) => Ok(Some(Self::decode(table, &row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, table: SyncTable, record: &SyncRecord) -> Result<(), StorageError> {
        self.write(table, record, false).await.map(|_| ())
    }

    async fn upsert_if_newer(&self, table: SyncTable, record: &SyncRecord) -> Result<bool, StorageError> {
        if !record.contains_key("updated_at") {
            return Err(StorageError::Backend(format!("{table} record without updated_at")));
        }
        self.write(table, record, true).await
    }

    async fn mark_synced(
        &self,
        table: SyncTable,
        id: i64,
        synced_at: i64,
        expected_updated_at: i64,
    ) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE {} SET sync_status = 'synced', \
             synced_at = CASE WHEN synced_at IS NULL OR synced_at < $1 THEN $1 ELSE synced_at END \
             WHERE id = $2 AND updated_at = $3",
            table.name()
        );
        let n = self.db.execute(&sql, &[synced_at.into(), id.into(), expected_updated_at.into()]).await?;
        Ok(n > 0)
    }

    async fn mark_conflict(&self, table: SyncTable, id: i64) -> Result<bool, StorageError> {
        let sql = format!("UPDATE {} SET sync_status = 'conflict' WHERE id = $1", table.name());
        Ok(self.db.execute(&sql, &[id.into()]).await? > 0)
    }

    async fn load_checkpoint(&self, clinic_id: i64, table: SyncTable) -> Result<Option<Checkpoint>, StorageError> {
        let row = self
            .db
            .fetch_optional(
                "SELECT cursor_updated_at, cursor_id, last_synced_at FROM sync_checkpoints \
                 WHERE clinic_id = $1 AND table_name = $2",
                &[clinic_id.into(), table.name().into()],
            )
            .await?;
        row.map(|r| {
            Ok(Checkpoint {
                cursor: Cursor { updated_at: db::int(&r, "cursor_updated_at")?, id: db::int(&r, "cursor_id")? },
                last_synced_at: db::int(&r, "last_synced_at")?,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(&self, clinic_id: i64, table: SyncTable, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.db
            .execute(
                "INSERT INTO sync_checkpoints (clinic_id, table_name, cursor_updated_at, cursor_id, last_synced_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT(clinic_id, table_name) DO UPDATE SET \
                 cursor_updated_at = excluded.cursor_updated_at, cursor_id = excluded.cursor_id, \
                 last_synced_at = excluded.last_synced_at",
                &[
                    clinic_id.into(),
                    table.name().into(),
                    checkpoint.cursor.updated_at.into(),
                    checkpoint.cursor.id.into(),
                    checkpoint.last_synced_at.into(),
                ],
            )
            .await?;
        debug!(clinic_id, %table, cursor = ?checkpoint.cursor, "checkpoint saved");
        Ok(())
    }

    async fn max_synced_at(&self, table: SyncTable, clinic_id: i64) -> Result<Option<i64>, StorageError> {
        let sql = format!("SELECT MAX(synced_at) AS m FROM {} WHERE {} = $1", table.name(), table.tenant_column());
        match self.db.fetch_optional(&sql, &[clinic_id.into()]).await? {
            Some(row) => db::opt_int(&row, "m"),
            None => Ok(None),
        }
    }

    async fn counts(&self, table: SyncTable, clinic_id: i64) -> Result<SyncCounts, StorageError> {
        let sql = format!(
            "SELECT sync_status, COUNT(*) AS n FROM {} WHERE {} = $1 GROUP BY sync_status",
            table.name(),
            table.tenant_column()
        );
        let mut counts = SyncCounts::default();
        for row in self.db.fetch_all(&sql, &[clinic_id.into()]).await? {
            let n = u64::try_from(db::int(&row, "n")?).unwrap_or_default();
            match db::text(&row, "sync_status")?.as_str() {
                "synced" => counts.synced += n,
                "conflict" => counts.conflicts += n,
                _ => counts.pending += n,
            }
        }
        Ok(counts)
    }

    async fn realign_ids(&self, table: SyncTable) -> Result<(), StorageError> {
        // SQLite AUTOINCREMENT follows explicit ids by itself
        if self.db.dialect() == Dialect::Postgres {
            let t = table.name();
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence('{t}', 'id'), \
                 GREATEST((SELECT COALESCE(MAX(id), 0) FROM {t}), 1))"
            );
            self.db.execute(&sql, &[]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqlSyncStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("sync.db").display());
        let db = Database::connect("test", &url).await.unwrap();
        db.execute(
            "INSERT INTO clinics (id, name, created_at, updated_at, sync_status) VALUES (1, 'Clinic 1', 1, 1, 'synced')",
            &[],
        )
        .await
        .unwrap();
        (dir, SqlSyncStore::new(db))
    }

    fn patient(id: i64, updated_at: i64, status: &str) -> SyncRecord {
        json!({
            "id": id, "clinic_id": 1, "display_id": format!("MRN-2025-{id:05}"), "name": "Asha",
            "age": 31, "gender": "F", "village": "", "phone": "", "referred_by": "", "treatment_type": "",
            "notes": null, "payment_type": "Cash", "created_at": updated_at, "updated_at": updated_at,
            "synced_at": null, "sync_status": status,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trips_kinds() {
        let (_dir, store) = store().await;
        store.upsert(SyncTable::Patients, &patient(7, 100, "local")).await.unwrap();

        let row = store.get(SyncTable::Patients, 7).await.unwrap().unwrap();
        assert_eq!(row["age"], 31);
        assert_eq!(row["display_id"], "MRN-2025-00007");
        assert!(row["notes"].is_null());

        let mut edited = patient(7, 200, "synced");
        edited.insert("name".into(), json!("Asha K"));
        store.upsert(SyncTable::Patients, &edited).await.unwrap();
        let row = store.get(SyncTable::Patients, 7).await.unwrap().unwrap();
        assert_eq!(row["name"], "Asha K");
        assert_eq!(row["sync_status"], "synced");
    }

    #[tokio::test]
    async fn test_guarded_upsert_never_replaces_a_newer_local_edit() {
        let (_dir, store) = store().await;
        let mut edited = patient(1, 150, "local");
        edited.insert("phone".into(), json!("NEW-PHONE"));
        store.upsert(SyncTable::Patients, &edited).await.unwrap();

        // Decided against the row as it was at 100; the edit at 150 landed since
        let mut pulled = patient(1, 101, "synced");
        pulled.insert("name".into(), json!("Asha Rao"));
        assert!(!store.upsert_if_newer(SyncTable::Patients, &pulled).await.unwrap());
        let row = store.get(SyncTable::Patients, 1).await.unwrap().unwrap();
        assert_eq!(row["phone"], "NEW-PHONE");
        assert_eq!(row["sync_status"], "local");

        // A tie only replaces a row that is already synced
        let mut tie = patient(1, 150, "synced");
        tie.insert("name".into(), json!("Asha Rao"));
        assert!(!store.upsert_if_newer(SyncTable::Patients, &tie).await.unwrap());
        assert!(store.mark_synced(SyncTable::Patients, 1, 160, 150).await.unwrap());
        assert!(store.upsert_if_newer(SyncTable::Patients, &tie).await.unwrap());

        let mut newer = patient(1, 300, "synced");
        newer.insert("name".into(), json!("Asha R"));
        assert!(store.upsert_if_newer(SyncTable::Patients, &newer).await.unwrap());
        assert!(store.upsert_if_newer(SyncTable::Patients, &patient(2, 10, "synced")).await.unwrap());
        assert_eq!(store.get(SyncTable::Patients, 1).await.unwrap().unwrap()["name"], "Asha R");
    }

    #[tokio::test]
    async fn test_pending_scan_uses_keyset_order() {
        let (_dir, store) = store().await;
        for (id, at) in [(1, 50), (2, 10), (3, 10)] {
            store.upsert(SyncTable::Patients, &patient(id, at, "local")).await.unwrap();
        }
        store.upsert(SyncTable::Patients, &patient(4, 5, "synced")).await.unwrap();

        let pending = store.fetch_pending(SyncTable::Patients, 1, Cursor::EPOCH, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 3, 1]);

        let next = store.fetch_changed(SyncTable::Patients, 1, Cursor { updated_at: 10, id: 2 }, 2).await.unwrap();
        let ids: Vec<_> = next.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_marker_updates() {
        let (_dir, store) = store().await;
        store.upsert(SyncTable::Patients, &patient(1, 100, "local")).await.unwrap();

        assert!(!store.mark_synced(SyncTable::Patients, 1, 500, 99).await.unwrap());
        assert!(store.mark_synced(SyncTable::Patients, 1, 500, 100).await.unwrap());
        assert!(store.mark_synced(SyncTable::Patients, 1, 400, 100).await.unwrap());
        let row = store.get(SyncTable::Patients, 1).await.unwrap().unwrap();
        assert_eq!(row["synced_at"], 500);

        assert!(store.mark_conflict(SyncTable::Patients, 1).await.unwrap());
        let counts = store.counts(SyncTable::Patients, 1).await.unwrap();
        assert_eq!(counts, SyncCounts { synced: 0, pending: 0, conflicts: 1 });
        assert_eq!(store.max_synced_at(SyncTable::Patients, 1).await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn test_constraint_errors_are_classified() {
        let (_dir, store) = store().await;
        store.upsert(SyncTable::Patients, &patient(1, 100, "local")).await.unwrap();

        let mut dup = patient(2, 100, "local");
        dup.insert("display_id".into(), json!("MRN-2025-00001"));
        let err = store.upsert(SyncTable::Patients, &dup).await.unwrap_err();
        assert!(matches!(err, StorageError::Unique { ref field } if field == "display_id"), "{err:?}");

        let mut orphan = patient(3, 100, "local");
        orphan.insert("clinic_id".into(), json!(99));
        let err = store.upsert(SyncTable::Patients, &orphan).await.unwrap_err();
        assert!(matches!(err, StorageError::ForeignKey(_)), "{err:?}");

        let mut drifted = patient(4, 100, "local");
        drifted.insert("blood_group".into(), json!("O+"));
        let err = store.upsert(SyncTable::Patients, &drifted).await.unwrap_err();
        assert!(matches!(err, StorageError::Incompatible { ref column, .. } if column == "blood_group"), "{err:?}");
    }

    #[tokio::test]
    async fn test_checkpoint_and_columns() {
        let (_dir, store) = store().await;
        assert!(store.load_checkpoint(1, SyncTable::Patients).await.unwrap().is_none());

        let cp = Checkpoint { cursor: Cursor { updated_at: 10, id: 3 }, last_synced_at: 99 };
        store.save_checkpoint(1, SyncTable::Patients, &cp).await.unwrap();
        store.save_checkpoint(1, SyncTable::Patients, &cp).await.unwrap();
        assert_eq!(store.load_checkpoint(1, SyncTable::Patients).await.unwrap(), Some(cp));

        let cols = store.columns(SyncTable::Patients).await.unwrap();
        assert!(cols.iter().any(|c| c == "display_id"));
        assert!(store.server_time().await.unwrap() > 1_600_000_000_000);
    }

    #[test]
    fn test_identifier_filter() {
        assert!(is_identifier("display_id"));
        assert!(!is_identifier("name; DROP TABLE users"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier(""));
    }
}
