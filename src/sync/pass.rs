// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One table pass: pull the peer's changes, then push local pending rows.
//!
//! ```text
//! cursor ──► fetch_changed(peer) ──► LWW vs local ──► upsert local (synced)
//!                                                   └► FK miss: deferred, cursor frozen
//! EPOCH  ──► fetch_pending(local) ─► LWW vs peer ───► upsert peer, mark local synced
//!                                                   └► peer newer: adopt peer row
//! ```
//!
//! The saved cursor never passes a row that was not applied, so a deferred
//! or interrupted row is fetched again next time. Re-applying rows that did
//! land is a no-op (identical ties are skipped).

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::lww::{self, Decision, Direction};
use super::store::{Peer, SyncStore};
use super::table::SyncTable;
use super::types::{record_int, Checkpoint, Cursor, SyncMode, SyncRecord, SyncSettings, TableSyncReport};
use crate::cache::Cache;
use crate::db::StorageError;
use crate::error::CoreError;

/// The two replicas a pass reconciles. `peer` is `None` when running
/// without a cloud store.
#[derive(Clone)]
pub(crate) struct Replicas {
    pub local: Arc<dyn SyncStore>,
    pub peer: Option<Peer>,
    pub cache: Cache,
}

/// A row whose parent was missing when it was applied. Retried once after
/// every table of the pass has run.
#[derive(Debug, Clone)]
pub(crate) struct Deferred {
    pub table: SyncTable,
    pub direction: Direction,
    pub record: SyncRecord,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TableOutcome {
    pub report: TableSyncReport,
    pub deferred: Vec<Deferred>,
}

enum RowFate {
    Done,
    Deferred,
}

struct TablePass<'a> {
    local: &'a dyn SyncStore,
    peer: &'a Peer,
    cache: &'a Cache,
    table: SyncTable,
    clinic_id: i64,
    mode: SyncMode,
    batch_size: usize,
    deadline: Instant,
    peer_time: i64,
    local_columns: HashSet<String>,
    peer_columns: HashSet<String>,
    previous: Option<Checkpoint>,
    safe_cursor: Cursor,
    peer_inserted: bool,
    report: TableSyncReport,
    deferred: Vec<Deferred>,
}

/// Run one table for one clinic. Never fails: problems end up in the report.
#[instrument(skip_all, fields(clinic_id = clinic_id, table = %table, mode = %mode))]
pub(crate) async fn run_table(
    replicas: Replicas,
    clinic_id: i64,
    table: SyncTable,
    mode: SyncMode,
    settings: SyncSettings,
) -> TableOutcome {
    let started = Instant::now();
    let mut report = TableSyncReport::new(table);

    let mut outcome = match replicas.peer.as_ref() {
        None => {
            report.unavailable("sync peer not configured (offline mode)");
            TableOutcome { report, deferred: Vec::new() }
        }
        Some(peer) => {
            let deadline = started + settings.table_timeout;
            match TablePass::prepare(&replicas, peer, clinic_id, table, mode, &settings, deadline).await {
                Ok(pass) => pass.execute().await,
                Err(e) => {
                    warn!(%table, clinic_id, error = %e, "sync pass could not start");
                    crate::metrics::record_error("sync", "prepare", if e.is_transient() { "unavailable" } else { "backend" });
                    if e.is_transient() {
                        report.unavailable(e.to_string());
                    } else {
                        report.errors.push(e.to_string());
                    }
                    TableOutcome { report, deferred: Vec::new() }
                }
            }
        }
    };

    outcome.report.settle();
    let r = &outcome.report;
    crate::metrics::record_sync_rows(table.name(), "pull", r.pulled);
    crate::metrics::record_sync_rows(table.name(), "push", r.pushed);
    crate::metrics::record_sync_conflicts(table.name(), r.conflicts);
    crate::metrics::record_sync_pass(table.name(), mode.as_str(), r.outcome.as_str(), started.elapsed());
    debug!(
        %table, clinic_id, pulled = r.pulled, pushed = r.pushed, skipped = r.skipped,
        conflicts = r.conflicts, deferred = outcome.deferred.len(), outcome = r.outcome.as_str(),
        "table pass finished"
    );
    outcome
}

impl<'a> TablePass<'a> {
    async fn prepare(
        replicas: &'a Replicas,
        peer: &'a Peer,
        clinic_id: i64,
        table: SyncTable,
        mode: SyncMode,
        settings: &SyncSettings,
        deadline: Instant,
    ) -> Result<TablePass<'a>, StorageError> {
        let local = replicas.local.as_ref();
        peer.ping().await?;
        let peer_time = peer.server_time().await?;
        let peer_columns = peer.columns(table).await?.into_iter().collect();
        let local_columns = local.columns(table).await?.into_iter().collect();
        let previous = local.load_checkpoint(clinic_id, table).await?;

        Ok(Self {
            local,
            peer,
            cache: &replicas.cache,
            table,
            clinic_id,
            mode,
            batch_size: settings.batch_size.max(1),
            deadline,
            peer_time,
            local_columns,
            peer_columns,
            previous,
            safe_cursor: Cursor::EPOCH,
            peer_inserted: false,
            report: TableSyncReport::new(table),
            deferred: Vec::new(),
        })
    }

    async fn execute(mut self) -> TableOutcome {
        let result = self.exchange().await;
        if let Err(e) = result {
            warn!(table = %self.table, clinic_id = self.clinic_id, error = %e, "sync pass aborted");
            if e.is_transient() {
                self.report.unavailable(e.to_string());
            } else {
                self.report.errors.push(e.to_string());
            }
        }

        // Progress made before an abort is still worth keeping
        let clean = self.report.errors.is_empty() && !self.report.deadline_hit;
        let checkpoint = Checkpoint {
            cursor: self.safe_cursor,
            last_synced_at: if clean {
                self.peer_time
            } else {
                self.previous.map_or(0, |p| p.last_synced_at)
            },
        };
        if Some(checkpoint) != self.previous {
            if let Err(e) = self.local.save_checkpoint(self.clinic_id, self.table, &checkpoint).await {
                warn!(table = %self.table, error = %e, "failed to save sync checkpoint");
                self.report.errors.push(format!("checkpoint not saved: {e}"));
            }
        }

        TableOutcome { report: self.report, deferred: self.deferred }
    }

    async fn exchange(&mut self) -> Result<(), StorageError> {
        let start = self.starting_cursor().await?;
        self.safe_cursor = start;
        self.pull(start).await?;
        if !self.report.deadline_hit {
            self.push().await?;
        }
        if self.peer_inserted {
            self.peer.realign_ids(self.table).await?;
        }
        Ok(())
    }

    async fn starting_cursor(&self) -> Result<Cursor, StorageError> {
        if self.mode == SyncMode::Full {
            return Ok(Cursor::EPOCH);
        }
        if let Some(previous) = self.previous {
            return Ok(previous.cursor);
        }
        let last = self.local.max_synced_at(self.table, self.clinic_id).await?;
        Ok(last.map_or(Cursor::EPOCH, Cursor::after_time))
    }

    fn expired(&mut self) -> bool {
        if Instant::now() >= self.deadline {
            self.report.deadline_hit = true;
        }
        self.report.deadline_hit
    }

    // ── pull ────────────────────────────────────────────────────────────

    async fn pull(&mut self, start: Cursor) -> Result<(), StorageError> {
        let mut after = start;
        let mut frozen = false;

        'batches: loop {
            if self.expired() {
                break;
            }
            let rows = self.peer.fetch_changed(self.table, self.clinic_id, after, self.batch_size).await?;
            let fetched = rows.len();
            let before = after;

            for row in rows {
                if self.expired() {
                    break 'batches;
                }
                let Some(cursor) = Cursor::of(&row) else {
                    self.report.errors.push(format!("{}: peer row without id or updated_at", self.table));
                    continue;
                };
                after = cursor;
                match self.pull_row(row).await? {
                    RowFate::Done if !frozen => self.safe_cursor = cursor,
                    RowFate::Done => {}
                    RowFate::Deferred => frozen = true,
                }
            }

            if fetched < self.batch_size || after == before {
                break;
            }
        }
        Ok(())
    }

    async fn pull_row(&mut self, remote: SyncRecord) -> Result<RowFate, StorageError> {
        let table = self.table;
        let id = record_int(&remote, "id").unwrap_or_default();

        if record_int(&remote, table.tenant_column()) != Some(self.clinic_id) {
            self.report.errors.push(format!("{table} {id}: peer row outside clinic {}", self.clinic_id));
            return Ok(RowFate::Done);
        }
        if let Some(column) = unknown_column(&remote, &self.local_columns) {
            self.incompatible(id, column).await?;
            return Ok(RowFate::Done);
        }

        let existing = self.local.get(table, id).await?;
        if let Some(local_row) = existing.as_ref() {
            if let Some(field) = identity_clash(table, &remote, local_row) {
                self.conflict(id, &format!("id {id} names a different row on the peer ({field})")).await?;
                return Ok(RowFate::Done);
            }
        }

        match lww::decide(&remote, existing.as_ref(), Direction::Pull) {
            Decision::Insert | Decision::Overwrite => self.adopt(remote, existing.as_ref()).await,
            Decision::Skip => {
                if let Some(local_row) = existing.as_ref() {
                    if !lww::is_synced(local_row) {
                        let stamp = record_int(local_row, "updated_at").unwrap_or_default();
                        self.local.mark_synced(table, id, self.peer_time, stamp).await?;
                    }
                }
                self.report.skipped += 1;
                Ok(RowFate::Done)
            }
            Decision::KeepExisting => {
                self.report.skipped += 1;
                Ok(RowFate::Done)
            }
        }
    }

    /// Write a peer row into the local store as synced. The write re-checks
    /// LWW against the stored row, so a local edit that landed after the
    /// decision keeps its place and stays pending.
    async fn adopt(&mut self, remote: SyncRecord, existing: Option<&SyncRecord>) -> Result<RowFate, StorageError> {
        let id = record_int(&remote, "id").unwrap_or_default();
        let stamped = mark_as_synced(remote, existing, self.peer_time);
        match self.local.upsert_if_newer(self.table, &stamped).await {
            Ok(true) => {
                self.report.pulled += 1;
                evict(self.cache, self.table, self.clinic_id, id).await;
                Ok(RowFate::Done)
            }
            Ok(false) => {
                debug!(table = %self.table, id, "local row changed during pull, kept");
                self.report.skipped += 1;
                Ok(RowFate::Done)
            }
            Err(StorageError::ForeignKey(reason)) => {
                debug!(table = %self.table, id, %reason, "pull deferred on missing parent");
                self.deferred.push(Deferred { table: self.table, direction: Direction::Pull, record: stamped, reason });
                Ok(RowFate::Deferred)
            }
            Err(StorageError::Unique { field }) => {
                self.conflict(id, &format!("{field} already used by another local row")).await?;
                Ok(RowFate::Done)
            }
            Err(StorageError::Incompatible { column, .. }) => {
                self.incompatible(id, column).await?;
                Ok(RowFate::Done)
            }
            Err(e) => Err(e),
        }
    }

    // ── push ────────────────────────────────────────────────────────────

    async fn push(&mut self) -> Result<(), StorageError> {
        let mut after = Cursor::EPOCH;
        'batches: loop {
            if self.expired() {
                break;
            }
            let rows = self.local.fetch_pending(self.table, self.clinic_id, after, self.batch_size).await?;
            let fetched = rows.len();
            let before = after;

            for row in rows {
                if self.expired() {
                    break 'batches;
                }
                let Some(cursor) = Cursor::of(&row) else {
                    continue;
                };
                after = cursor;
                self.push_row(row).await?;
            }

            if fetched < self.batch_size || after == before {
                break;
            }
        }
        Ok(())
    }

    async fn push_row(&mut self, local_row: SyncRecord) -> Result<(), StorageError> {
        let table = self.table;
        let id = record_int(&local_row, "id").unwrap_or_default();

        if let Some(column) = unknown_column(&local_row, &self.peer_columns) {
            return self.incompatible(id, column).await;
        }

        let remote = self.peer.get(table, id).await?;
        if let Some(peer_row) = remote.as_ref() {
            if let Some(field) = identity_clash(table, &local_row, peer_row) {
                return self.conflict(id, &format!("id {id} names a different row on the peer ({field})")).await;
            }
        }

        match lww::decide(&local_row, remote.as_ref(), Direction::Push) {
            Decision::Insert | Decision::Overwrite => self.send(local_row, remote.is_none()).await,
            Decision::Skip => {
                let stamp = record_int(&local_row, "updated_at").unwrap_or_default();
                self.local.mark_synced(table, id, self.peer_time, stamp).await?;
                self.report.skipped += 1;
                Ok(())
            }
            Decision::KeepExisting => {
                // Peer is newer: take its version instead
                if let Some(peer_row) = remote {
                    self.adopt(peer_row, Some(&local_row)).await?;
                }
                Ok(())
            }
        }
    }

    async fn send(&mut self, local_row: SyncRecord, inserting: bool) -> Result<(), StorageError> {
        let table = self.table;
        let id = record_int(&local_row, "id").unwrap_or_default();
        let stamp = record_int(&local_row, "updated_at").unwrap_or_default();
        let outgoing = mark_as_synced(local_row.clone(), None, self.peer_time);

        match self.peer.upsert(table, &outgoing).await {
            Ok(()) => {
                self.peer_inserted |= inserting;
                // A local edit racing the push keeps the row pending
                if self.local.mark_synced(table, id, self.peer_time, stamp).await? {
                    evict(self.cache, table, self.clinic_id, id).await;
                }
                self.report.pushed += 1;
                Ok(())
            }
            Err(StorageError::ForeignKey(reason)) => {
                debug!(%table, id, %reason, "push deferred on missing parent");
                self.deferred.push(Deferred { table, direction: Direction::Push, record: outgoing, reason });
                Ok(())
            }
            Err(StorageError::Unique { field }) => self.resolve_unique(local_row, &field).await,
            Err(StorageError::Incompatible { column, .. }) => self.incompatible(id, column).await,
            Err(e) => Err(e),
        }
    }

    /// The peer rejected a push on a unique column. The peer is
    /// authoritative: take its row if it is the newer version of ours,
    /// otherwise park ours as a conflict.
    async fn resolve_unique(&mut self, local_row: SyncRecord, field: &str) -> Result<(), StorageError> {
        let id = record_int(&local_row, "id").unwrap_or_default();
        match self.peer.get(self.table, id).await? {
            Some(peer_row) => match lww::decide(&local_row, Some(&peer_row), Direction::Push) {
                Decision::KeepExisting => {
                    self.adopt(peer_row, Some(&local_row)).await?;
                    Ok(())
                }
                Decision::Skip => {
                    let stamp = record_int(&local_row, "updated_at").unwrap_or_default();
                    self.local.mark_synced(self.table, id, self.peer_time, stamp).await?;
                    self.report.skipped += 1;
                    Ok(())
                }
                _ => self.conflict(id, &format!("{field} already taken on the peer")).await,
            },
            None => self.conflict(id, &format!("{field} already taken on the peer")).await,
        }
    }

    // ── outcomes ────────────────────────────────────────────────────────

    async fn conflict(&mut self, id: i64, why: &str) -> Result<(), StorageError> {
        warn!(table = %self.table, clinic_id = self.clinic_id, id, why, "sync conflict");
        self.local.mark_conflict(self.table, id).await?;
        self.report.conflicts += 1;
        Ok(())
    }

    async fn incompatible(&mut self, id: i64, column: String) -> Result<(), StorageError> {
        let err = CoreError::Incompatible { table: self.table.name().into(), column };
        warn!(table = %self.table, id, error = %err, "schema mismatch between replicas");
        self.local.mark_conflict(self.table, id).await?;
        self.report.conflicts += 1;
        Ok(())
    }
}

/// Retry deferred rows once, in table dependency order, folding the
/// results into the matching table reports.
pub(crate) async fn retry_deferred(replicas: &Replicas, mut deferred: Vec<Deferred>, reports: &mut [TableSyncReport]) {
    if deferred.is_empty() {
        return;
    }
    deferred.sort_by_key(|d| d.table);
    info!(rows = deferred.len(), "retrying rows deferred on missing parents");

    for item in deferred {
        let Some(report) = reports.iter_mut().find(|r| r.table == item.table) else {
            continue;
        };
        let id = record_int(&item.record, "id").unwrap_or_default();
        let result = match item.direction {
            Direction::Pull => retry_pull(replicas, &item, report).await,
            Direction::Push => retry_push(replicas, &item, report).await,
        };
        if let Err(e) = result {
            warn!(table = %item.table, id, error = %e, first = %item.reason, "deferred row still failing");
            report.errors.push(format!("{} {id}: {e}", item.table));
        }
        report.settle();
    }
}

async fn retry_pull(replicas: &Replicas, item: &Deferred, report: &mut TableSyncReport) -> Result<(), StorageError> {
    let id = record_int(&item.record, "id").unwrap_or_default();
    // The local row may have moved on while the rest of the pass ran
    let existing = replicas.local.get(item.table, id).await?;
    match lww::decide(&item.record, existing.as_ref(), Direction::Pull) {
        Decision::Insert | Decision::Overwrite => {
            if replicas.local.upsert_if_newer(item.table, &item.record).await? {
                report.pulled += 1;
                evict(&replicas.cache, item.table, tenant_of(&item.record, item.table), id).await;
            } else {
                report.skipped += 1;
            }
        }
        Decision::Skip | Decision::KeepExisting => report.skipped += 1,
    }
    Ok(())
}

/// A push whose parent is still missing on the peer becomes a conflict.
async fn retry_push(replicas: &Replicas, item: &Deferred, report: &mut TableSyncReport) -> Result<(), StorageError> {
    let Some(peer) = replicas.peer.as_ref() else {
        return Ok(());
    };
    let id = record_int(&item.record, "id").unwrap_or_default();
    match peer.upsert(item.table, &item.record).await {
        Ok(()) => {
            let synced_at = record_int(&item.record, "synced_at").unwrap_or_default();
            let stamp = record_int(&item.record, "updated_at").unwrap_or_default();
            if replicas.local.mark_synced(item.table, id, synced_at, stamp).await? {
                evict(&replicas.cache, item.table, tenant_of(&item.record, item.table), id).await;
            }
            report.pushed += 1;
            Ok(())
        }
        Err(StorageError::ForeignKey(reason)) => {
            warn!(table = %item.table, id, %reason, "parent still missing on peer, marking conflict");
            replicas.local.mark_conflict(item.table, id).await?;
            report.conflicts += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn tenant_of(record: &SyncRecord, table: SyncTable) -> i64 {
    record_int(record, table.tenant_column()).unwrap_or_default()
}

/// Drop cached entries that a sync write to the local row made stale.
async fn evict(cache: &Cache, table: SyncTable, clinic_id: i64, id: i64) {
    match table {
        SyncTable::Patients => cache.invalidate_patient(clinic_id, Some(id)).await,
        SyncTable::Clinics => cache.invalidate_clinic(id).await,
        SyncTable::Users => cache.invalidate_user(id).await,
        _ => {}
    }
}

/// First column of `record` the receiving side does not have.
fn unknown_column(record: &SyncRecord, known: &HashSet<String>) -> Option<String> {
    record.keys().find(|k| !known.contains(k.as_str())).cloned()
}

/// A shared id that names a different row on each side: different tenant,
/// or a different display id.
fn identity_clash(table: SyncTable, incoming: &SyncRecord, existing: &SyncRecord) -> Option<&'static str> {
    let tenant = table.tenant_column();
    if let (Some(a), Some(b)) = (record_int(incoming, tenant), record_int(existing, tenant)) {
        if a != b {
            return Some("clinic");
        }
    }
    if table.has_display_id() {
        let a = incoming.get("display_id").and_then(Value::as_str);
        let b = existing.get("display_id").and_then(Value::as_str);
        if a.is_some() && b.is_some() && a != b {
            return Some("display_id");
        }
    }
    None
}

/// Stamp a row as synced with `synced_at` no earlier than the receiving
/// side's current value.
fn mark_as_synced(mut record: SyncRecord, existing: Option<&SyncRecord>, peer_time: i64) -> SyncRecord {
    let floor = existing.and_then(|r| record_int(r, "synced_at")).unwrap_or(i64::MIN);
    record.insert("synced_at".into(), Value::from(peer_time.max(floor)));
    record.insert("sync_status".into(), Value::from("synced"));
    record
}
