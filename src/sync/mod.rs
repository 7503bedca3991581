// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bidirectional sync between the on-site store and the cloud peer.
//!
//! The [`SyncEngine`] reconciles one clinic at a time, table by table, with
//! last-writer-wins on `updated_at`. Tables run concurrently; rows inside a
//! table apply in `(updated_at, id)` order.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running ⇄ Syncing → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use clinic_core::sync::{EngineState, MemorySyncStore, SyncEngine, SyncSettings, SyncStore};
//! use tokio::sync::watch;
//!
//! let local = Arc::new(MemorySyncStore::new("local"));
//! let peer: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::new("cloud"));
//! let (_tx, rx) = watch::channel(SyncSettings::default());
//! let engine = SyncEngine::new(local, Some(peer), rx);
//! assert_eq!(engine.state(), EngineState::Created);
//! ```

mod lifecycle;
mod lww;
mod memory_store;
mod pass;
mod single_flight;
mod sql_store;
mod store;
mod table;
mod types;

pub use lww::{decide, Decision, Direction};
pub use memory_store::MemorySyncStore;
pub use sql_store::SqlSyncStore;
pub use store::{Peer, SyncStore};
pub use table::{SyncTable, SYNC_TABLES};
pub use types::{
    Checkpoint, Cursor, EngineState, PassOutcome, SyncCounts, SyncMode, SyncRecord, SyncReport, SyncSettings,
    SyncStatusReport, SyncTotals, TableStatus, TableSyncReport,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::CoreResult;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::tenant::TenantContext;
use pass::{Replicas, TableOutcome};
use single_flight::SingleFlight;

/// Coalescing key: one pass per user, clinic and table at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlightKey {
    user_id: i64,
    clinic_id: i64,
    table: SyncTable,
}

/// Sync coordinator.
///
/// Holds both replicas, the per-table status map and the sessions the
/// background loop syncs on every tick. Shared behind an `Arc`; all methods
/// take `&self`.
pub struct SyncEngine {
    /// Settings (updated at runtime via watch channel)
    pub(super) settings: RwLock<SyncSettings>,

    /// Runtime settings updates (Mutex for interior mutability in run loop)
    pub(super) settings_rx: Mutex<watch::Receiver<SyncSettings>>,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    replicas: Replicas,

    flights: Arc<SingleFlight<FlightKey, TableOutcome>>,

    /// Last error per `(clinic, table)`, cleared by a clean pass
    last_errors: DashMap<(i64, SyncTable), String>,

    /// Contexts the background loop syncs, keyed by `(user, clinic)`
    pub(super) sessions: DashMap<(i64, i64), TenantContext>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("local", &self.replicas.local.label())
            .field("peer", &self.replicas.peer)
            .field("state", &self.state())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl SyncEngine {
    /// Build an engine over `local` and an optional `peer`. Without a peer
    /// (offline mode) every table reports unavailable.
    pub fn new(
        local: Arc<dyn SyncStore>,
        peer: Option<Arc<dyn SyncStore>>,
        settings_rx: watch::Receiver<SyncSettings>,
    ) -> Self {
        Self::with_circuit(local, peer, settings_rx, CircuitConfig::sync_peer())
    }

    pub fn with_circuit(
        local: Arc<dyn SyncStore>,
        peer: Option<Arc<dyn SyncStore>>,
        settings_rx: watch::Receiver<SyncSettings>,
        circuit: CircuitConfig,
    ) -> Self {
        let settings = settings_rx.borrow().clone();
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            settings: RwLock::new(settings),
            settings_rx: Mutex::new(settings_rx),
            state: state_tx,
            state_rx,
            replicas: Replicas { local, peer: peer.map(|p| Peer::new(p, circuit)), cache: Cache::disabled() },
            flights: Arc::new(SingleFlight::default()),
            last_errors: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// The response cache the repositories read through. Rows pulled into
    /// the local store evict their cached entries.
    #[must_use]
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.replicas.cache = cache;
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn has_peer(&self) -> bool {
        self.replicas.peer.is_some()
    }

    #[must_use]
    pub fn settings(&self) -> SyncSettings {
        self.settings.read().clone()
    }

    /// Add a context to the background loop. Replaces any earlier context
    /// of the same user and clinic.
    pub fn register_session(&self, ctx: &TenantContext) {
        let key = (ctx.user_id(), ctx.clinic_id());
        if self.sessions.insert(key, ctx.clone()).is_none() {
            info!(user_id = key.0, clinic_id = key.1, "sync session registered");
        }
    }

    pub fn unregister_session(&self, user_id: i64, clinic_id: i64) {
        self.sessions.remove(&(user_id, clinic_id));
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every table from the epoch cursor.
    pub async fn full_sync(&self, ctx: &TenantContext) -> CoreResult<SyncReport> {
        self.sync_all(ctx, SyncMode::Full).await
    }

    /// Every table from its persisted cursor.
    pub async fn incremental_sync(&self, ctx: &TenantContext) -> CoreResult<SyncReport> {
        self.sync_all(ctx, SyncMode::Incremental).await
    }

    #[instrument(skip(self, ctx), fields(clinic_id = ctx.clinic_id(), user_id = ctx.user_id(), run_id))]
    pub async fn sync_all(&self, ctx: &TenantContext, mode: SyncMode) -> CoreResult<SyncReport> {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());
        let started = std::time::Instant::now();

        let mut jobs = JoinSet::new();
        for table in SYNC_TABLES {
            jobs.spawn(self.table_job(ctx, table, mode));
        }

        let mut finished: BTreeMap<SyncTable, (TableOutcome, bool)> = BTreeMap::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((table, outcome, led)) => {
                    finished.insert(table, (outcome, led));
                }
                Err(e) => warn!(error = %e, "sync table task failed"),
            }
        }

        let mut reports = Vec::with_capacity(SYNC_TABLES.len());
        let mut deferred = Vec::new();
        for table in SYNC_TABLES {
            match finished.remove(&table) {
                Some((outcome, led)) => {
                    // Followers leave the retry to the caller that ran the pass
                    if led {
                        deferred.extend(outcome.deferred);
                    }
                    reports.push(outcome.report);
                }
                None => {
                    let mut report = TableSyncReport::new(table);
                    report.errors.push("sync task failed".into());
                    report.settle();
                    reports.push(report);
                }
            }
        }
        pass::retry_deferred(&self.replicas, deferred, &mut reports).await;

        let mut totals = SyncTotals::default();
        for report in &reports {
            totals.add(report);
            self.remember(ctx.clinic_id(), report);
        }

        info!(
            %mode, pulled = totals.pulled, pushed = totals.pushed, conflicts = totals.conflicts,
            errors = totals.errors, unavailable = totals.unavailable,
            elapsed_ms = started.elapsed().as_millis() as u64, "sync pass complete"
        );
        Ok(SyncReport { run_id, mode, clinic_id: ctx.clinic_id(), tables: reports, totals })
    }

    /// One table, with its deferred rows retried at the end.
    #[instrument(skip(self, ctx), fields(clinic_id = ctx.clinic_id()))]
    pub async fn sync_table(&self, ctx: &TenantContext, table: SyncTable, mode: SyncMode) -> CoreResult<TableSyncReport> {
        let (_, outcome, led) = self.table_job(ctx, table, mode).await;
        let mut reports = [outcome.report];
        if led {
            pass::retry_deferred(&self.replicas, outcome.deferred, &mut reports).await;
        }
        let [report] = reports;
        self.remember(ctx.clinic_id(), &report);
        Ok(report)
    }

    /// Per-table marker counts, last sync time and last error for the
    /// caller's clinic, read from the local store.
    pub async fn status(&self, ctx: &TenantContext) -> CoreResult<SyncStatusReport> {
        let clinic_id = ctx.clinic_id();
        let local = &self.replicas.local;
        let mut tables = BTreeMap::new();
        for table in SYNC_TABLES {
            let checkpoint = local.load_checkpoint(clinic_id, table).await?;
            let counts = local.counts(table, clinic_id).await?;
            crate::metrics::set_sync_pending(table.name(), counts.pending);
            let last_synced_at = checkpoint.map(|c| c.last_synced_at).filter(|t| *t > 0);
            let error = self.last_errors.get(&(clinic_id, table)).map(|e| e.clone());
            tables.insert(table.name().to_string(), TableStatus::new(last_synced_at, counts, error));
        }
        Ok(SyncStatusReport { clinic_id, tables })
    }

    /// Future running one table pass through the single-flight map. Owns
    /// everything it needs so it can be spawned.
    fn table_job(
        &self,
        ctx: &TenantContext,
        table: SyncTable,
        mode: SyncMode,
    ) -> impl std::future::Future<Output = (SyncTable, TableOutcome, bool)> + Send + 'static {
        let replicas = self.replicas.clone();
        let flights = Arc::clone(&self.flights);
        let settings = self.settings.read().clone();
        let clinic_id = ctx.clinic_id();
        let key = FlightKey { user_id: ctx.user_id(), clinic_id, table };

        async move {
            let (outcome, led) = flights
                .run(key, || pass::run_table(replicas, clinic_id, table, mode, settings))
                .await;
            if !led {
                crate::metrics::record_sync_coalesced(table.name());
            }
            (table, outcome, led)
        }
    }

    fn remember(&self, clinic_id: i64, report: &TableSyncReport) {
        match report.error_summary() {
            Some(error) => {
                self.last_errors.insert((clinic_id, report.table), error);
            }
            None => {
                self.last_errors.remove(&(clinic_id, report.table));
            }
        }
    }
}
