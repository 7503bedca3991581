//! End-to-end scenarios against a temp-file SQLite store.
//!
//! Everything goes through the public API: a clinic is onboarded with the
//! user repository, contexts come from `TenantResolver::context_for`, and
//! the cloud side of sync is an in-process `MemorySyncStore`.
//!
//! # Running Tests
//! ```bash
//! cargo test --test scenarios
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;

use clinic_core::models::{CreateClinic, CreatePatient, Pagination, PatientFilter, UpdatePatient};
use clinic_core::sync::{Checkpoint, Cursor, MemorySyncStore, PassOutcome, SqlSyncStore, SyncCounts, SyncRecord};
use clinic_core::{
    Cache, CircuitConfig, CoreError, Database, IdGenerator, Repositories, StorageError, SyncEngine, SyncSettings,
    SyncStore, SyncTable, TenantContext, TenantResolver,
};

// =============================================================================
// Helpers
// =============================================================================

const PASSWORD: &str = "correct-horse-battery";

struct Site {
    _dir: TempDir,
    db: Database,
    cache: Cache,
    repos: Repositories,
    resolver: TenantResolver,
}

async fn site() -> Site {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("clinic.db").display());
    let db = Database::connect("local", &url).await.unwrap();
    let cache = Cache::in_memory();
    let repos = Repositories::new(db.clone(), IdGenerator::new(db.clone(), 5), cache.clone());
    let resolver = TenantResolver::new(db.clone(), "scenario-secret", Duration::from_secs(3600));
    Site { _dir: dir, db, cache, repos, resolver }
}

/// Register an owner, onboard a clinic for them and return their context.
async fn onboard(site: &Site, email: &str, clinic: &str) -> TenantContext {
    let owner = site.repos.users.register(email, "Owner", PASSWORD.into()).await.unwrap();
    site.repos
        .clinics
        .create(owner.id, CreateClinic { name: clinic.into(), ..Default::default() })
        .await
        .unwrap();
    site.resolver.context_for(owner.id).await.unwrap()
}

fn fast_circuit() -> CircuitConfig {
    CircuitConfig { failure_threshold: 2, success_threshold: 1, recovery_timeout: Duration::from_millis(50) }
}

fn settings() -> SyncSettings {
    SyncSettings { batch_size: 3, table_timeout: Duration::from_secs(30), interval: Duration::from_secs(3600) }
}

fn engine(site: &Site, peer: &Arc<MemorySyncStore>) -> SyncEngine {
    engine_over(site, Arc::new(SqlSyncStore::new(site.db.clone())), peer)
}

fn engine_over(site: &Site, local: Arc<dyn SyncStore>, peer: &Arc<MemorySyncStore>) -> SyncEngine {
    let (_tx, rx) = watch::channel(settings());
    SyncEngine::with_circuit(local, Some(peer.clone() as Arc<dyn SyncStore>), rx, fast_circuit())
        .with_cache(site.cache.clone())
}

/// Seed the cloud with the clinic row and a copy of local patient `id`
/// renamed to `name`, `ahead` ms newer than the local row.
async fn cloud_copy(site: &Site, peer: &MemorySyncStore, ctx: &TenantContext, id: i64, name: &str, ahead: i64) {
    let local = SqlSyncStore::new(site.db.clone());
    let clinic = local.get(SyncTable::Clinics, ctx.clinic_id()).await.unwrap().unwrap();
    peer.put(SyncTable::Clinics, clinic);

    let mut remote = local.get(SyncTable::Patients, id).await.unwrap().unwrap();
    let at = remote["updated_at"].as_i64().unwrap() + ahead;
    remote.insert("name".into(), Value::from(name));
    remote.insert("updated_at".into(), Value::from(at));
    remote.insert("sync_status".into(), Value::from("synced"));
    peer.put(SyncTable::Patients, remote);
}

/// Local store that lets a receptionist edit one patient right before the
/// engine writes the pulled copy of it.
struct EditDuringPull {
    inner: SqlSyncStore,
    repos: Repositories,
    ctx: TenantContext,
    patient_id: i64,
    fired: AtomicBool,
}

#[async_trait]
impl SyncStore for EditDuringPull {
    fn label(&self) -> &str {
        self.inner.label()
    }
    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
    async fn server_time(&self) -> Result<i64, StorageError> {
        self.inner.server_time().await
    }
    async fn columns(&self, table: SyncTable) -> Result<Vec<String>, StorageError> {
        self.inner.columns(table).await
    }
    async fn fetch_changed(&self, table: SyncTable, clinic_id: i64, after: Cursor, limit: usize) -> Result<Vec<SyncRecord>, StorageError> {
        self.inner.fetch_changed(table, clinic_id, after, limit).await
    }
    async fn fetch_pending(&self, table: SyncTable, clinic_id: i64, after: Cursor, limit: usize) -> Result<Vec<SyncRecord>, StorageError> {
        self.inner.fetch_pending(table, clinic_id, after, limit).await
    }
    async fn get(&self, table: SyncTable, id: i64) -> Result<Option<SyncRecord>, StorageError> {
        self.inner.get(table, id).await
    }
    async fn upsert(&self, table: SyncTable, record: &SyncRecord) -> Result<(), StorageError> {
        self.inner.upsert(table, record).await
    }
    async fn upsert_if_newer(&self, table: SyncTable, record: &SyncRecord) -> Result<bool, StorageError> {
        let target = table == SyncTable::Patients && record["id"].as_i64() == Some(self.patient_id);
        if target && !self.fired.swap(true, Ordering::SeqCst) {
            let patch = UpdatePatient { phone: Some("NEW-PHONE".into()), ..Default::default() };
            self.repos.patients.update(&self.ctx, self.patient_id, patch).await.unwrap();
        }
        self.inner.upsert_if_newer(table, record).await
    }
    async fn mark_synced(&self, table: SyncTable, id: i64, synced_at: i64, expected: i64) -> Result<bool, StorageError> {
        self.inner.mark_synced(table, id, synced_at, expected).await
    }
    async fn mark_conflict(&self, table: SyncTable, id: i64) -> Result<bool, StorageError> {
        self.inner.mark_conflict(table, id).await
    }
    async fn load_checkpoint(&self, clinic_id: i64, table: SyncTable) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.load_checkpoint(clinic_id, table).await
    }
    async fn save_checkpoint(&self, clinic_id: i64, table: SyncTable, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.save_checkpoint(clinic_id, table, checkpoint).await
    }
    async fn max_synced_at(&self, table: SyncTable, clinic_id: i64) -> Result<Option<i64>, StorageError> {
        self.inner.max_synced_at(table, clinic_id).await
    }
    async fn counts(&self, table: SyncTable, clinic_id: i64) -> Result<SyncCounts, StorageError> {
        self.inner.counts(table, clinic_id).await
    }
}

async fn patient(site: &Site, ctx: &TenantContext, name: &str) -> i64 {
    site.repos
        .patients
        .create(ctx, CreatePatient { name: name.into(), ..Default::default() })
        .await
        .unwrap()
        .id
}

// =============================================================================
// Identifiers
// =============================================================================

#[tokio::test]
async fn concurrent_creates_get_consecutive_display_ids() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..10 {
        let repos = site.repos.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            repos.patients.create(&ctx, CreatePatient { name: format!("Patient {n}"), ..Default::default() }).await
        });
    }

    let mut issued = BTreeSet::new();
    while let Some(joined) = tasks.join_next().await {
        issued.insert(joined.unwrap().unwrap().display_id);
    }

    let year = IdGenerator::current_year();
    let expected: BTreeSet<String> = (1..=10).map(|n| format!("MRN-{year}-{n:05}")).collect();
    assert_eq!(issued, expected);
}

#[tokio::test]
async fn display_ids_are_shared_across_clinics() {
    let site = site().await;
    let a = onboard(&site, "owner@a.test", "Clinic A").await;
    let b = onboard(&site, "owner@b.test", "Clinic B").await;

    let first = site.repos.patients.create(&a, CreatePatient { name: "Asha".into(), ..Default::default() }).await.unwrap();
    let second = site.repos.patients.create(&b, CreatePatient { name: "Ravi".into(), ..Default::default() }).await.unwrap();

    assert_ne!(first.display_id, second.display_id);
    assert!(second.display_id.ends_with("00002"));
}

// =============================================================================
// Tenant isolation
// =============================================================================

#[tokio::test]
async fn reads_never_cross_clinics() {
    let site = site().await;
    let a = onboard(&site, "owner@a.test", "Clinic A").await;
    let b = onboard(&site, "owner@b.test", "Clinic B").await;
    let theirs = patient(&site, &b, "Meena").await;
    patient(&site, &a, "Asha").await;

    let err = site.repos.patients.get_by_id(&a, theirs).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    let page = site.repos.patients.list(&a, &PatientFilter::default(), &Pagination::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert!(page.items.iter().all(|p| p.clinic_id == a.clinic_id()));

    let patch = UpdatePatient { name: Some("Hijacked".into()), ..Default::default() };
    assert!(site.repos.patients.update(&a, theirs, patch).await.is_err());
    assert_eq!(site.repos.patients.get_by_id(&b, theirs).await.unwrap().name, "Meena");
}

#[tokio::test]
async fn transferred_user_token_stops_resolving() {
    let site = site().await;
    let a = onboard(&site, "owner@a.test", "Clinic A").await;
    let b = onboard(&site, "owner@b.test", "Clinic B").await;

    let staff = site
        .repos
        .users
        .create(
            &a,
            clinic_core::models::CreateUser {
                email: "desk@a.test".into(),
                name: "Desk".into(),
                role: clinic_core::Role::Receptionist,
                password: Some(PASSWORD.into()),
                permissions: Default::default(),
            },
        )
        .await
        .unwrap();
    let principal = site.resolver.context_for(staff.id).await.unwrap().user().clone();
    let token = site.resolver.issue_token(&principal).unwrap();
    assert!(site.resolver.resolve(Some(&format!("Bearer {token}"))).await.is_ok());

    site.repos.users.transfer_to_clinic(&a, staff.id, b.clinic_id()).await.unwrap();
    let err = site.resolver.resolve(Some(&format!("Bearer {token}"))).await.unwrap_err();
    assert!(matches!(err, CoreError::Unauthenticated));
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn newer_cloud_row_wins_over_older_local_edit() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;
    let id = patient(&site, &ctx, "Asha").await;

    // Age the local edit to t=100 so the cloud copy at t=200 is newer
    let local = SqlSyncStore::new(site.db.clone());
    let mut aged = local.get(SyncTable::Patients, id).await.unwrap().unwrap();
    aged.insert("updated_at".into(), Value::from(100));
    local.upsert(SyncTable::Patients, &aged).await.unwrap();

    let peer = Arc::new(MemorySyncStore::new("cloud"));
    let clinic = local.get(SyncTable::Clinics, ctx.clinic_id()).await.unwrap().unwrap();
    peer.put(SyncTable::Clinics, clinic);

    let mut remote = local.get(SyncTable::Patients, id).await.unwrap().unwrap();
    remote.insert("name".into(), Value::from("Asha Rao"));
    remote.insert("updated_at".into(), Value::from(200));
    remote.insert("sync_status".into(), Value::from("synced"));
    peer.put(SyncTable::Patients, remote);

    let report = engine(&site, &peer).incremental_sync(&ctx).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    let p = site.repos.patients.get_by_id(&ctx, id).await.unwrap();
    assert_eq!(p.name, "Asha Rao");
    assert_eq!(p.marker.sync_status, clinic_core::models::SyncStatus::Synced);
    assert!(p.marker.synced_at.unwrap() >= 200);
}

#[tokio::test]
async fn pulled_row_replaces_what_the_cache_served() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;
    let id = patient(&site, &ctx, "Asha").await;
    let peer = Arc::new(MemorySyncStore::new("cloud"));
    let engine = engine(&site, &peer);
    assert!(engine.full_sync(&ctx).await.unwrap().is_clean());

    // Warm the entity and list entries
    assert_eq!(site.repos.patients.get_by_id(&ctx, id).await.unwrap().name, "Asha");
    site.repos.patients.list(&ctx, &PatientFilter::default(), &Pagination::default()).await.unwrap();

    cloud_copy(&site, &peer, &ctx, id, "Asha Rao", 1_000).await;
    let report = engine.incremental_sync(&ctx).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.totals.pulled, 1);

    assert_eq!(site.repos.patients.get_by_id(&ctx, id).await.unwrap().name, "Asha Rao");
    let page = site.repos.patients.list(&ctx, &PatientFilter::default(), &Pagination::default()).await.unwrap();
    assert_eq!(page.items[0].name, "Asha Rao");
}

#[tokio::test]
async fn local_edit_landing_mid_pull_is_kept_and_pushed() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;
    let id = patient(&site, &ctx, "Asha").await;

    // Cloud copy is 1 ms newer than the row the pull decision will see
    let peer = Arc::new(MemorySyncStore::new("cloud"));
    cloud_copy(&site, &peer, &ctx, id, "Asha Rao", 1).await;

    let local = Arc::new(EditDuringPull {
        inner: SqlSyncStore::new(site.db.clone()),
        repos: site.repos.clone(),
        ctx: ctx.clone(),
        patient_id: id,
        fired: AtomicBool::new(false),
    });
    let report = engine_over(&site, local.clone(), &peer).incremental_sync(&ctx).await.unwrap();
    assert!(local.fired.load(Ordering::SeqCst));
    assert!(report.is_clean(), "{report:?}");

    let patients = report.tables.iter().find(|t| t.table == SyncTable::Patients).unwrap();
    assert_eq!(patients.pulled, 0);
    assert_eq!(patients.pushed, 1);

    // The edit survived locally and reached the cloud
    let row = site.repos.patients.get_by_id(&ctx, id).await.unwrap();
    assert_eq!(row.phone, "NEW-PHONE");
    assert_eq!(row.name, "Asha");
    assert_eq!(row.marker.sync_status, clinic_core::models::SyncStatus::Synced);
    assert_eq!(peer.row(SyncTable::Patients, id).unwrap()["phone"], "NEW-PHONE");
}

#[tokio::test]
async fn offline_write_is_pushed_once_cloud_returns() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;
    let peer = Arc::new(MemorySyncStore::new("cloud"));
    let engine = engine(&site, &peer);

    peer.set_offline(true);
    let id = patient(&site, &ctx, "Quentin").await;
    let report = engine.incremental_sync(&ctx).await.unwrap();
    assert!(report.tables.iter().all(|t| t.outcome == PassOutcome::Unavailable));

    let status = engine.status(&ctx).await.unwrap();
    assert!(!status.tables["patients"].synced);
    assert_eq!(status.tables["patients"].pending, 1);
    assert!(status.tables["patients"].error.is_some());

    peer.set_offline(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = engine.incremental_sync(&ctx).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    assert_eq!(peer.row(SyncTable::Patients, id).unwrap()["name"], "Quentin");
    let status = engine.status(&ctx).await.unwrap();
    assert!(status.tables["patients"].synced);
    assert_eq!(status.tables["patients"].pending, 0);
    assert_eq!(status.tables["patients"].synced_rows, 1);
    assert!(status.tables["patients"].error.is_none());
}

#[tokio::test]
async fn clean_pass_leaves_every_row_settled_and_repeats_as_noop() {
    let site = site().await;
    let ctx = onboard(&site, "owner@a.test", "Clinic A").await;
    for name in ["Asha", "Ravi", "Meena", "Kiran", "Divya"] {
        patient(&site, &ctx, name).await;
    }
    let peer = Arc::new(MemorySyncStore::new("cloud"));
    let engine = engine(&site, &peer);

    let first = engine.full_sync(&ctx).await.unwrap();
    assert!(first.is_clean(), "{first:?}");
    assert!(first.totals.pushed >= 7);

    let status = engine.status(&ctx).await.unwrap();
    for (table, counts) in &status.tables {
        assert_eq!(counts.pending, 0, "{table} still has pending rows");
    }

    let second = engine.incremental_sync(&ctx).await.unwrap();
    assert!(second.is_clean());
    assert_eq!(second.totals.pulled, 0);
    assert_eq!(second.totals.pushed, 0);
    assert_eq!(second.totals.conflicts, 0);
}

#[tokio::test]
async fn cloud_rows_of_other_clinics_stay_in_the_cloud() {
    let site = site().await;
    let a = onboard(&site, "owner@a.test", "Clinic A").await;
    let b = onboard(&site, "owner@b.test", "Clinic B").await;
    let b_patient = patient(&site, &b, "Meena").await;

    let peer = Arc::new(MemorySyncStore::new("cloud"));
    let engine = engine(&site, &peer);
    engine.full_sync(&a).await.unwrap();

    assert!(peer.row(SyncTable::Patients, b_patient).is_none());
    assert!(peer.rows(SyncTable::Patients).iter().all(|r| r["clinic_id"] == a.clinic_id()));
}
