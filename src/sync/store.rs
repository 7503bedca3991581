// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seam of the sync engine. Both replicas implement [`SyncStore`];
//! the remote side is reached through [`Peer`], which puts a circuit
//! breaker in front of every call.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::table::SyncTable;
use super::types::{Checkpoint, Cursor, SyncCounts, SyncRecord};
use crate::db::StorageError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};

/// One replica's view of the replicated tables.
///
/// Reads of changed/pending rows are tenant-scoped; `get`, `upsert` and the
/// marker updates address a row by primary key, which is shared between
/// replicas.
#[async_trait]
pub trait SyncStore: Send + Sync {
    fn label(&self) -> &str;

    async fn ping(&self) -> Result<(), StorageError>;

    /// The store's clock, epoch milliseconds.
    async fn server_time(&self) -> Result<i64, StorageError>;

    /// Column names the store's copy of `table` has.
    async fn columns(&self, table: SyncTable) -> Result<Vec<String>, StorageError>;

    /// Rows of the clinic with `(updated_at, id) > after`, ascending.
    async fn fetch_changed(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError>;

    /// Rows of the clinic with `sync_status = 'local'` and
    /// `(updated_at, id) > after`, ascending.
    async fn fetch_pending(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError>;

    async fn get(&self, table: SyncTable, id: i64) -> Result<Option<SyncRecord>, StorageError>;

    /// Insert, or overwrite the columns present in `record`, keyed by `id`.
    async fn upsert(&self, table: SyncTable, record: &SyncRecord) -> Result<(), StorageError>;

    /// [`upsert`](Self::upsert) guarded by last-writer-wins at write time:
    /// an existing row is replaced only if `record` has a newer
    /// `updated_at`, or the same one while the stored row is synced.
    /// Returns false when the stored row won and nothing was written.
    async fn upsert_if_newer(&self, table: SyncTable, record: &SyncRecord) -> Result<bool, StorageError>;

    /// Set `sync_status = synced` and advance `synced_at` (never backwards),
    /// but only if the row still has `expected_updated_at`. Returns whether
    /// the row was marked.
    async fn mark_synced(
        &self,
        table: SyncTable,
        id: i64,
        synced_at: i64,
        expected_updated_at: i64,
    ) -> Result<bool, StorageError>;

    async fn mark_conflict(&self, table: SyncTable, id: i64) -> Result<bool, StorageError>;

    async fn load_checkpoint(&self, clinic_id: i64, table: SyncTable) -> Result<Option<Checkpoint>, StorageError>;

    async fn save_checkpoint(&self, clinic_id: i64, table: SyncTable, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Latest `synced_at` among the clinic's rows.
    async fn max_synced_at(&self, table: SyncTable, clinic_id: i64) -> Result<Option<i64>, StorageError>;

    async fn counts(&self, table: SyncTable, clinic_id: i64) -> Result<SyncCounts, StorageError>;

    /// Move the id generator past explicitly inserted ids.
    async fn realign_ids(&self, _table: SyncTable) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The remote replica behind a circuit breaker.
///
/// Only transient failures count against the breaker; constraint violations
/// are answers, not outages. An open breaker surfaces as
/// [`StorageError::Unavailable`].
#[derive(Clone)]
pub struct Peer {
    store: Arc<dyn SyncStore>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("label", &self.store.label())
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl Peer {
    #[must_use]
    pub fn new(store: Arc<dyn SyncStore>, circuit: CircuitConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(format!("sync_peer_{}", store.label()), circuit));
        Self { store, breaker }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.store.label()
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, Fut>(&self, op: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match self.breaker.call_when(|| op, StorageError::is_transient).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Rejected) => {
                Err(StorageError::Unavailable(format!("{} circuit open", self.breaker.name())))
            }
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        self.guarded(self.store.ping()).await
    }

    pub async fn server_time(&self) -> Result<i64, StorageError> {
        self.guarded(self.store.server_time()).await
    }

    pub async fn columns(&self, table: SyncTable) -> Result<Vec<String>, StorageError> {
        self.guarded(self.store.columns(table)).await
    }

    pub async fn fetch_changed(
        &self,
        table: SyncTable,
        clinic_id: i64,
        after: Cursor,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, StorageError> {
        self.guarded(self.store.fetch_changed(table, clinic_id, after, limit)).await
    }

    pub async fn get(&self, table: SyncTable, id: i64) -> Result<Option<SyncRecord>, StorageError> {
        self.guarded(self.store.get(table, id)).await
    }

    pub async fn upsert(&self, table: SyncTable, record: &SyncRecord) -> Result<(), StorageError> {
        self.guarded(self.store.upsert(table, record)).await
    }

    pub async fn realign_ids(&self, table: SyncTable) -> Result<(), StorageError> {
        self.guarded(self.store.realign_ids(table)).await
    }
}
