// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`SyncStore`] for tests and offline simulation.
//!
//! Enforces what the SQL schema enforces and the engine depends on: known
//! columns, unique `display_id` (and user email), and references to parent
//! rows. Can be switched offline to simulate an unreachable peer.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::lww;
use super::store::SyncStore;
use super::table::SyncTable;
use super::types::{record_int, record_text, Checkpoint, Cursor, SyncCounts, SyncRecord};
use crate::db::{now_millis, StorageError};

type Tables = HashMap<SyncTable, BTreeMap<i64, SyncRecord>>;

pub struct MemorySyncStore {
    label: String,
    // One lock over all tables: upsert checks parents and siblings atomically
    tables: RwLock<Tables>,
    checkpoints: DashMap<(i64, SyncTable), Checkpoint>,
    extra_columns: DashMap<SyncTable, Vec<String>>,
    offline: AtomicBool,
}

impl MemorySyncStore {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tables: RwLock::new(HashMap::new()),
            checkpoints: DashMap::new(),
            extra_columns: DashMap::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Store a row as-is, bypassing constraint checks.
    pub fn put(&self, table: SyncTable, record: SyncRecord) {
        if let Some(id) = record_int(&record, "id") {
            self.tables.write().entry(table).or_default().insert(id, record);
        }
    }

    #[must_use]
    pub fn row(&self, table: SyncTable, id: i64) -> Option<SyncRecord> {
        self.tables.read().get(&table).and_then(|rows| rows.get(&id).cloned())
    }

    #[must_use]
    pub fn rows(&self, table: SyncTable) -> Vec<SyncRecord> {
        self.tables.read().get(&table).map(|rows| rows.values().cloned().collect()).unwrap_or_default()
    }

    /// Simulate a schema that has a column the other replica lacks.
    pub fn add_column(&self, table: SyncTable, column: &str) {
        self.extra_columns.entry(table).or_default().push(column.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total rows across tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.tables.write().clear();
        self.checkpoints.clear();
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{} is offline", self.label)));
        }
        Ok(())
    }

    fn known_columns(&self, table: SyncTable) -> HashSet<String> {
        let mut known: HashSet<String> = table.columns().iter().map(|(c, _)| (*c).to_string()).collect();
        if let Some(extra) = self.extra_columns.get(&table) {
            known.extend(extra.iter().cloned());
        }
        known
    }

    fn scan<F>(&self, table: SyncTable, clinic_id: i64, after: Cursor, limit: usize, keep: F) -> Vec<SyncRecord>
    where
        F: Fn(&SyncRecord) -> bool,
    {
        let tables = self.tables.read();
        let Some(rows) = tables.get(&table) else {
            return Vec::new();
        };
        let mut hits: Vec<(Cursor, &SyncRecord)> = rows
            .values()
            .filter(|r| record_int(r, table.tenant_column()) == Some(clinic_id))
            .filter(|r| keep(r))
            .filter_map(|r| Cursor::of(r).map(|c| (c, r)))
            .filter(|(c, _)| *c > after)
            .collect();
        hits.sort_by_key(|(c, _)| *c);
        hits.into_iter().take(limit).map(|(_, r)| r.clone()).collect()
    }

    fn unique_clash(rows: &BTreeMap<i64, SyncRecord>, id: i64, column: &str, value: &str) -> bool {
        rows.iter().any(|(other, r)| *other != id && record_text(r, column) == Some(value))
    }

    /// Validate and apply `record`. With `guarded`, the last-writer-wins
    /// check runs under the same write lock as the update.
    fn write(&self, table: SyncTable, record: &SyncRecord, guarded: bool) -> Result<bool, StorageError> {
        self.check_online()?;
        let id = record_int(record, "id").ok_or_else(|| StorageError::Backend("record without id".into()))?;

        let known = self.known_columns(table);
        if let Some(column) = record.keys().find(|k| !known.contains(k.as_str())) {
            return Err(StorageError::Incompatible { table: table.name().into(), column: column.clone() });
        }

        let mut tables = self.tables.write();
        if guarded {
            let stored = tables.get(&table).and_then(|rows| rows.get(&id));
            if stored.is_some_and(|stored| !lww::supersedes(record, stored)) {
                return Ok(false);
            }
        }
        for (column, parent) in table.references() {
            if let Some(parent_id) = record_int(record, column) {
                let present = tables.get(parent).is_some_and(|rows| rows.contains_key(&parent_id));
                if !present {
                    return Err(StorageError::ForeignKey(format!("{table}.{column} → {parent} {parent_id}")));
                }
            }
        }

        let rows = tables.entry(table).or_default();
        let unique: &[&str] = match table {
            SyncTable::Users => &["email"],
            t if t.has_display_id() => &["display_id"],
            _ => &[],
        };
        for column in unique {
            if let Some(value) = record_text(record, column) {
                if Self::unique_clash(rows, id, column, value) {
                    return Err(StorageError::Unique { field: (*column).to_string() });
                }
            }
        }

        let row = rows.entry(id).or_default();
        for (column, value) in record {
            row.insert(column.clone(), value.clone());
        }
        Ok(true)
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_online()
    }

    async fn server_time(&self) -> Result<i64, StorageError> {
        self.check_online()?;
        Ok(now_millis())
    }

    async fn columns(&self, table: SyncTable) -> Result<Vec<String>, StorageError> {
        self.check_online()?;
        let mut cols: Vec<String> = self.known_columns(table).into_iter().collect();
        cols.sort();
        Ok(cols)
    }

    async fn fetch_changed(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        self.check_online()?;
        Ok(self.scan(table, clinic_id, after, limit, |_| true))
    }

    async fn fetch_pending(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        self.check_online()?;
        Ok(self.scan(table, clinic_id, after, limit, |r| record_text(r, "sync_status") == Some("local")))
    }

    async fn get(&self, table: SyncTable, id: i64) -> Result<Option<SyncRecord>, StorageError> {
        self.check_online()?;
        Ok(self.row(table, id))
    }

    async fn upsert(&self, table: SyncTable, record: &SyncRecord) -> Result<(), StorageError> {
        self.write(table, record, false).map(|_| ())
    }

    async fn upsert_if_newer(&self, table: SyncTable, record: &SyncRecord) -> Result<bool, StorageError> {
        self.write(table, record, true)
    }

    async fn mark_synced(
        &self,
        table: SyncTable,
        id: i64,
        synced_at: i64,
        expected_updated_at: i64,
    ) -> Result<bool, StorageError> {
        self.check_online()?;
        let mut tables = self.tables.write();
        let Some(row) = tables.get_mut(&table).and_then(|rows| rows.get_mut(&id)) else {
            return Ok(false);
        };
        if record_int(row, "updated_at") != Some(expected_updated_at) {
            return Ok(false);
        }
        let previous = record_int(row, "synced_at").unwrap_or(i64::MIN);
        row.insert("synced_at".into(), Value::from(previous.max(synced_at)));
        row.insert("sync_status".into(), Value::from("synced"));
        Ok(true)
    }

    async fn mark_conflict(&self, table: SyncTable, id: i64) -> Result<bool, StorageError> {
        self.check_online()?;
        let mut tables = self.tables.write();
        let Some(row) = tables.get_mut(&table).and_then(|rows| rows.get_mut(&id)) else {
            return Ok(false);
        };
        row.insert("sync_status".into(), Value::from("conflict"));
        Ok(true)
    }

    async fn load_checkpoint(&self, clinic_id: i64, table: SyncTable) -> Result<Option<Checkpoint>, StorageError> {
        self.check_online()?;
        Ok(self.checkpoints.get(&(clinic_id, table)).map(|c| *c))
    }

    async fn save_checkpoint(&self, clinic_id: i64, table: SyncTable, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.check_online()?;
        self.checkpoints.insert((clinic_id, table), *checkpoint);
        Ok(())
    }

    async fn max_synced_at(&self, table: SyncTable, clinic_id: i64) -> Result<Option<i64>, StorageError> {
        self.check_online()?;
        let tables = self.tables.read();
        Ok(tables.get(&table).and_then(|rows| {
            rows.values()
                .filter(|r| record_int(r, table.tenant_column()) == Some(clinic_id))
                .filter_map(|r| record_int(r, "synced_at"))
                .max()
        }))
    }

    async fn counts(&self, table: SyncTable, clinic_id: i64) -> Result<SyncCounts, StorageError> {
        self.check_online()?;
        let tables = self.tables.read();
        let mut counts = SyncCounts::default();
        let rows = tables.get(&table).into_iter().flat_map(BTreeMap::values);
        for row in rows.filter(|r| record_int(r, table.tenant_column()) == Some(clinic_id)) {
            match record_text(row, "sync_status") {
                Some("synced") => counts.synced += 1,
                Some("conflict") => counts.conflicts += 1,
                _ => counts.pending += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> SyncRecord {
        v.as_object().cloned().unwrap()
    }

    fn clinic(id: i64) -> SyncRecord {
        rec(json!({"id": id, "name": format!("Clinic {id}"), "status": "active", "created_at": 1, "updated_at": 1, "sync_status": "synced"}))
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemorySyncStore::default();
        assert!(store.is_empty());
        assert_eq!(store.label(), "memory");
    }

    #[tokio::test]
    async fn test_upsert_merges_columns() {
        let store = MemorySyncStore::default();
        store.upsert(SyncTable::Clinics, &clinic(1)).await.unwrap();
        store.upsert(SyncTable::Clinics, &rec(json!({"id": 1, "phone": "080"}))).await.unwrap();

        let row = store.row(SyncTable::Clinics, 1).unwrap();
        assert_eq!(row["name"], "Clinic 1");
        assert_eq!(row["phone"], "080");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_enforces_references_and_display_id() {
        let store = MemorySyncStore::default();
        let patient = |id: i64, display: &str| {
            rec(json!({"id": id, "clinic_id": 1, "display_id": display, "name": "P", "updated_at": 5}))
        };

        let orphan = store.upsert(SyncTable::Patients, &patient(1, "MRN-2025-00001")).await;
        assert!(matches!(orphan, Err(StorageError::ForeignKey(_))));

        store.upsert(SyncTable::Clinics, &clinic(1)).await.unwrap();
        store.upsert(SyncTable::Patients, &patient(1, "MRN-2025-00001")).await.unwrap();
        let dup = store.upsert(SyncTable::Patients, &patient(2, "MRN-2025-00001")).await;
        assert!(matches!(dup, Err(StorageError::Unique { ref field }) if field == "display_id"));
    }

    #[tokio::test]
    async fn test_unknown_column_is_incompatible() {
        let store = MemorySyncStore::default();
        let mut row = clinic(1);
        row.insert("logo_url".into(), json!("x"));
        let result = store.upsert(SyncTable::Clinics, &row).await;
        assert!(matches!(result, Err(StorageError::Incompatible { ref column, .. }) if column == "logo_url"));

        store.add_column(SyncTable::Clinics, "logo_url");
        store.upsert(SyncTable::Clinics, &row).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_synced_requires_unchanged_row() {
        let store = MemorySyncStore::default();
        store.put(SyncTable::Clinics, rec(json!({"id": 1, "updated_at": 10, "synced_at": 50, "sync_status": "local"})));

        assert!(!store.mark_synced(SyncTable::Clinics, 1, 60, 9).await.unwrap());
        assert!(store.mark_synced(SyncTable::Clinics, 1, 40, 10).await.unwrap());

        let row = store.row(SyncTable::Clinics, 1).unwrap();
        assert_eq!(row["sync_status"], "synced");
        // synced_at never moves backwards
        assert_eq!(row["synced_at"], 50);
    }

    #[tokio::test]
    async fn test_guarded_upsert_keeps_a_newer_stored_row() {
        let store = MemorySyncStore::default();
        store.put(SyncTable::Clinics, rec(json!({"id": 1, "phone": "NEW", "updated_at": 150, "sync_status": "local"})));

        let pulled = rec(json!({"id": 1, "phone": "", "updated_at": 101, "sync_status": "synced"}));
        assert!(!store.upsert_if_newer(SyncTable::Clinics, &pulled).await.unwrap());
        assert_eq!(store.row(SyncTable::Clinics, 1).unwrap()["phone"], "NEW");

        let newer = rec(json!({"id": 1, "phone": "080", "updated_at": 200, "sync_status": "synced"}));
        assert!(store.upsert_if_newer(SyncTable::Clinics, &newer).await.unwrap());
        assert!(store.upsert_if_newer(SyncTable::Clinics, &clinic(2)).await.unwrap());
        assert_eq!(store.row(SyncTable::Clinics, 1).unwrap()["phone"], "080");
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = MemorySyncStore::default();
        store.set_offline(true);
        assert!(matches!(store.ping().await, Err(StorageError::Unavailable(_))));
        store.set_offline(false);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_is_tenant_scoped_and_ordered() {
        let store = MemorySyncStore::default();
        for (id, clinic_id, at) in [(1, 1, 30), (2, 2, 10), (3, 1, 10), (4, 1, 10)] {
            store.put(SyncTable::Patients, rec(json!({"id": id, "clinic_id": clinic_id, "updated_at": at, "sync_status": "local"})));
        }
        let rows = store.fetch_changed(SyncTable::Patients, 1, Cursor::EPOCH, 10).await.unwrap();
        let ids: Vec<i64> = rows.iter().filter_map(|r| record_int(r, "id")).collect();
        assert_eq!(ids, vec![3, 4, 1]);

        let after = Cursor { updated_at: 10, id: 3 };
        let rows = store.fetch_pending(SyncTable::Patients, 1, after, 1).await.unwrap();
        assert_eq!(record_int(&rows[0], "id"), Some(4));
    }
}
