// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed, clinic-scoped data access.
//!
//! Every statement that reads or changes tenant rows is built with
//! [`ScopedQuery`], so it carries `clinic_id = $1` from the caller's
//! [`TenantContext`](crate::tenant::TenantContext). A row that belongs to
//! another clinic is indistinguishable from a missing one.
//!
//! Writes stamp the sync marker: inserts start at
//! `created_at = updated_at = now, sync_status = 'local'`; updates move
//! `updated_at` strictly forward and reset `sync_status` to `'local'`.

pub mod appointment;
pub mod attendance;
pub mod clinic;
pub mod device;
pub mod patient;
pub mod payment;
pub mod reference;
pub mod report;
pub mod user;

use sqlx::any::AnyRow;
use std::collections::BTreeMap;

use crate::cache::Cache;
use crate::db::query::{insert_sql, ScopedQuery, SqlParam};
use crate::db::{self, now_millis, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::ids::IdGenerator;
use crate::models::{PaginatedResult, Pagination, SyncMarker, SyncStatus};

pub use appointment::AppointmentRepository;
pub use attendance::AttendanceRepository;
pub use clinic::ClinicRepository;
pub use device::DeviceRepository;
pub use patient::PatientRepository;
pub use payment::PaymentRepository;
pub use reference::{CatalogRepository, ReferringDoctorRepository};
pub use report::ReportRepository;
pub use user::UserRepository;

/// Every repository over one store.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub clinics: ClinicRepository,
    pub users: UserRepository,
    pub patients: PatientRepository,
    pub reports: ReportRepository,
    pub payments: PaymentRepository,
    pub appointments: AppointmentRepository,
    pub scan_types: CatalogRepository,
    pub treatment_types: CatalogRepository,
    pub referring_doctors: ReferringDoctorRepository,
    pub devices: DeviceRepository,
    pub attendance: AttendanceRepository,
}

impl Repositories {
    #[must_use]
    pub fn new(db: Database, ids: IdGenerator, cache: Cache) -> Self {
        Self {
            clinics: ClinicRepository::new(db.clone(), cache.clone()),
            users: UserRepository::new(db.clone(), cache.clone()),
            patients: PatientRepository::new(db.clone(), ids.clone(), cache.clone()),
            reports: ReportRepository::new(db.clone(), ids.clone()),
            payments: PaymentRepository::new(db.clone(), ids),
            appointments: AppointmentRepository::new(db.clone()),
            scan_types: CatalogRepository::scan_types(db.clone()),
            treatment_types: CatalogRepository::treatment_types(db.clone()),
            referring_doctors: ReferringDoctorRepository::new(db.clone()),
            devices: DeviceRepository::new(db.clone()),
            attendance: AttendanceRepository::new(db),
        }
    }
}

pub(crate) fn marker(row: &AnyRow) -> Result<SyncMarker, StorageError> {
    Ok(SyncMarker {
        created_at: db::int(row, "created_at")?,
        updated_at: db::int(row, "updated_at")?,
        synced_at: db::opt_int(row, "synced_at")?,
        sync_status: SyncStatus::parse(&db::text(row, "sync_status")?),
    })
}

type RowMapper<T> = fn(&AnyRow) -> Result<T, StorageError>;

/// Column assignments collected from a typed patch. `None` fields are
/// left untouched.
#[derive(Debug, Default)]
pub(crate) struct Patch {
    sets: Vec<(&'static str, SqlParam)>,
    expressions: Vec<&'static str>,
}

impl Patch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set<V: Into<SqlParam>>(mut self, column: &'static str, value: Option<V>) -> Self {
        if let Some(v) = value {
            self.sets.push((column, v.into()));
        }
        self
    }

    pub(crate) fn set_value<V: Into<SqlParam>>(mut self, column: &'static str, value: V) -> Self {
        self.sets.push((column, value.into()));
        self
    }

    /// Literal SET clause, e.g. `send_count = send_count + 1`.
    pub(crate) fn expr(mut self, clause: &'static str) -> Self {
        self.expressions.push(clause);
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.expressions.is_empty()
    }
}

/// Per-operation outcome counter.
pub(crate) fn track<T>(entity: &str, op: &str, result: CoreResult<T>) -> CoreResult<T> {
    let status = match &result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    crate::metrics::record_operation(entity, op, status);
    result
}

pub(crate) async fn fetch_one<T>(
    db: &Database,
    query: ScopedQuery,
    columns: &str,
    map: RowMapper<T>,
    entity: &'static str,
    id: i64,
) -> CoreResult<T> {
    let row = db.fetch_optional(&query.select_sql(columns), query.params()).await?;
    match row {
        Some(row) => Ok(map(&row)?),
        None => Err(CoreError::not_found(entity, id)),
    }
}

pub(crate) async fn fetch_optional<T>(
    db: &Database,
    query: ScopedQuery,
    columns: &str,
    map: RowMapper<T>,
) -> CoreResult<Option<T>> {
    let row = db.fetch_optional(&query.select_sql(columns), query.params()).await?;
    Ok(row.as_ref().map(map).transpose()?)
}

pub(crate) async fn fetch_all<T>(
    db: &Database,
    query: ScopedQuery,
    columns: &str,
    map: RowMapper<T>,
) -> CoreResult<Vec<T>> {
    let rows = db.fetch_all(&query.select_sql(columns), query.params()).await?;
    Ok(rows.iter().map(map).collect::<Result<Vec<_>, _>>()?)
}

/// Count plus one ordered page of the same predicate.
pub(crate) async fn fetch_page<T>(
    db: &Database,
    query: ScopedQuery,
    columns: &str,
    order: &'static str,
    page: &Pagination,
    map: RowMapper<T>,
) -> CoreResult<PaginatedResult<T>> {
    let total = count(db, &query).await?;
    let items = fetch_all(db, query.order_by(order).page(page), columns, map).await?;
    Ok(PaginatedResult { items, total, offset: page.offset(), limit: page.limit() })
}

pub(crate) async fn count(db: &Database, query: &ScopedQuery) -> CoreResult<i64> {
    let row = db.fetch_optional(&query.count_sql(), query.params()).await?;
    Ok(row.map(|r| db::int(&r, "n")).transpose()?.unwrap_or(0))
}

/// `SUM(column)` over the scoped rows; money columns are floating point.
pub(crate) async fn sum(db: &Database, query: &ScopedQuery, column: &str) -> CoreResult<f64> {
    let row = db
        .fetch_optional(&query.aggregate_sql(&format!("SUM({column})"), "total"), query.params())
        .await?;
    Ok(row.map(|r| db::opt_real(&r, "total")).transpose()?.flatten().unwrap_or(0.0))
}

pub(crate) async fn group_counts(db: &Database, query: &ScopedQuery, column: &str) -> CoreResult<BTreeMap<String, i64>> {
    let rows = db.fetch_all(&query.group_count_sql(column), query.params()).await?;
    let mut out = BTreeMap::new();
    for row in &rows {
        let key = db::opt_text(row, "k")?.unwrap_or_default();
        out.insert(key, db::int(row, "n")?);
    }
    Ok(out)
}

/// Insert a row with a fresh sync marker and return it.
pub(crate) async fn insert_row<T>(
    db: &Database,
    table: &'static str,
    mut values: Vec<(&'static str, SqlParam)>,
    columns: &str,
    map: RowMapper<T>,
) -> CoreResult<T> {
    let now = now_millis();
    values.push(("created_at", now.into()));
    values.push(("updated_at", now.into()));
    values.push(("sync_status", SyncStatus::Local.as_str().into()));

    let names: Vec<&'static str> = values.iter().map(|(c, _)| *c).collect();
    let params: Vec<SqlParam> = values.into_iter().map(|(_, v)| v).collect();
    let row = db
        .write_returning(&insert_sql(table, &names, columns), &params)
        .await?
        .ok_or_else(|| CoreError::Internal(format!("insert into {table} returned nothing")))?;
    Ok(map(&row)?)
}

/// Apply `patch` to the scoped row and return the new version. An empty
/// patch is a read and does not touch the sync marker.
pub(crate) async fn apply_patch<T>(
    db: &Database,
    query: ScopedQuery,
    patch: Patch,
    columns: &str,
    map: RowMapper<T>,
    entity: &'static str,
    id: i64,
) -> CoreResult<T> {
    if patch.is_empty() {
        return fetch_one(db, query, columns, map, entity, id).await;
    }
    let (sql, params) = query.into_stamped_update(patch.sets, &patch.expressions, now_millis(), Some(columns));
    match db.write_returning(&sql, &params).await? {
        Some(row) => Ok(map(&row)?),
        None => Err(CoreError::not_found(entity, id)),
    }
}

pub(crate) async fn delete_row(db: &Database, query: ScopedQuery, entity: &'static str, id: i64) -> CoreResult<()> {
    let affected = db.execute(&query.delete_sql(), query.params()).await?;
    if affected == 0 {
        return Err(CoreError::not_found(entity, id));
    }
    Ok(())
}

/// Fails with `InvalidReference` unless `table` has row `id` in the
/// caller's clinic. Guards foreign keys against cross-tenant ids.
pub(crate) async fn ensure_owned(db: &Database, query: ScopedQuery, what: &str, id: i64) -> CoreResult<()> {
    if count(db, &query).await? == 0 {
        return Err(CoreError::InvalidReference(format!("{what} {id}")));
    }
    Ok(())
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}
