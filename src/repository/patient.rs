// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use sqlx::any::AnyRow;
use tracing::{debug, instrument};

use super::{apply_patch, delete_row, fetch_one, fetch_page, group_counts, count, insert_row, marker, require_non_empty, track, Patch};
use crate::cache::{keys, Cache};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, Database, StorageError};
use crate::error::CoreResult;
use crate::ids::{IdGenerator, RecordType};
use crate::models::{CreatePatient, PaginatedResult, Pagination, Patient, PatientFilter, PatientStats, UpdatePatient};
use crate::tenant::TenantContext;

const ENTITY: &str = "patients";

const COLUMNS: &str = "id, clinic_id, display_id, name, age, gender, village, phone, referred_by, \
                       treatment_type, notes, payment_type, created_at, updated_at, synced_at, sync_status";

const SEARCH_COLUMNS: [&str; 3] = ["name", "phone", "display_id"];

fn from_row(row: &AnyRow) -> Result<Patient, StorageError> {
    Ok(Patient {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        display_id: db::text(row, "display_id")?,
        name: db::text(row, "name")?,
        age: db::int(row, "age")?,
        gender: db::text(row, "gender")?,
        village: db::text(row, "village")?,
        phone: db::text(row, "phone")?,
        referred_by: db::text(row, "referred_by")?,
        treatment_type: db::text(row, "treatment_type")?,
        notes: db::opt_text(row, "notes")?,
        payment_type: db::text(row, "payment_type")?,
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct PatientRepository {
    db: Database,
    ids: IdGenerator,
    cache: Cache,
}

impl PatientRepository {
    #[must_use]
    pub fn new(db: Database, ids: IdGenerator, cache: Cache) -> Self {
        Self { db, ids, cache }
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<Patient> {
        let key = keys::patient(id);
        if let Some(hit) = self.cache.get_json::<Patient>(&key).await {
            // Cached rows are shared across tenants by id; re-check ownership
            if hit.clinic_id == ctx.clinic_id() {
                return Ok(hit);
            }
        }
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let patient = track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "patient", id).await)?;
        self.cache.set_json(&key, &patient, self.cache.ttl()).await;
        Ok(patient)
    }

    /// Newest first. Plain pages and searches are cached per clinic.
    pub async fn list(&self, ctx: &TenantContext, filter: &PatientFilter, page: &Pagination) -> CoreResult<PaginatedResult<Patient>> {
        let _timer = crate::metrics::OperationTimer::start(ENTITY, "list");
        let key = keys::patients_page(ctx.clinic_id(), filter.search.as_deref(), page);
        let cacheable = filter.phone.is_none();
        if cacheable {
            if let Some(hit) = self.cache.get_json::<PaginatedResult<Patient>>(&key).await {
                return Ok(hit);
            }
        }

        let mut q = ScopedQuery::new(ctx, ENTITY).eq_opt("phone", filter.phone.clone());
        if let Some(search) = filter.search.as_deref() {
            q = q.like_any(&SEARCH_COLUMNS, search);
        }
        let result = track(
            ENTITY,
            "list",
            fetch_page(&self.db, q, COLUMNS, "created_at DESC, id DESC", page, from_row).await,
        )?;
        if cacheable {
            self.cache.set_json(&key, &result, self.cache.ttl()).await;
        }
        Ok(result)
    }

    /// Name/phone/display-id substring search.
    pub async fn search(&self, ctx: &TenantContext, query: &str, page: &Pagination) -> CoreResult<PaginatedResult<Patient>> {
        let filter = PatientFilter { search: Some(query.to_string()), phone: None };
        self.list(ctx, &filter, page).await
    }

    #[instrument(skip(self, ctx, input), fields(clinic_id = ctx.clinic_id()))]
    pub async fn create(&self, ctx: &TenantContext, input: CreatePatient) -> CoreResult<Patient> {
        require_non_empty("name", &input.name)?;
        if input.age < 0 {
            return Err(crate::error::CoreError::Validation("age must not be negative".into()));
        }

        let result = self
            .ids
            .issue(RecordType::Patient, |display_id| {
                let values: Vec<(&'static str, SqlParam)> = vec![
                    ("clinic_id", ctx.clinic_id().into()),
                    ("display_id", display_id.to_string().into()),
                    ("name", input.name.trim().into()),
                    ("age", input.age.into()),
                    ("gender", input.gender.as_str().into()),
                    ("village", input.village.as_str().into()),
                    ("phone", input.phone.as_str().into()),
                    ("referred_by", input.referred_by.as_str().into()),
                    ("treatment_type", input.treatment_type.as_str().into()),
                    ("notes", input.notes.clone().into()),
                    ("payment_type", input.payment_type.clone().unwrap_or_else(|| "Cash".into()).into()),
                ];
                insert_row(&self.db, ENTITY, values, COLUMNS, from_row)
            })
            .await;
        let patient = track(ENTITY, "create", result)?;

        self.cache.invalidate_patient(ctx.clinic_id(), None).await;
        debug!(patient_id = patient.id, display_id = %patient.display_id, "patient created");
        Ok(patient)
    }

    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdatePatient) -> CoreResult<Patient> {
        if let Some(name) = patch.name.as_deref() {
            require_non_empty("name", name)?;
        }
        let changes = Patch::new()
            .set("name", patch.name)
            .set("age", patch.age)
            .set("gender", patch.gender)
            .set("village", patch.village)
            .set("phone", patch.phone)
            .set("referred_by", patch.referred_by)
            .set("treatment_type", patch.treatment_type)
            .set("notes", patch.notes)
            .set("payment_type", patch.payment_type);

        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let result = apply_patch(&self.db, q, changes, COLUMNS, from_row, "patient", id).await;
        let patient = track(ENTITY, "update", result)?;
        self.cache.invalidate_patient(ctx.clinic_id(), Some(id)).await;
        Ok(patient)
    }

    /// Hard delete. Fails with `InvalidReference` while reports, payments or
    /// appointments still point at the patient.
    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "delete", delete_row(&self.db, q, "patient", id).await)?;
        self.cache.invalidate_patient(ctx.clinic_id(), Some(id)).await;
        Ok(())
    }

    pub async fn stats(&self, ctx: &TenantContext) -> CoreResult<PatientStats> {
        let q = ScopedQuery::new(ctx, ENTITY);
        Ok(PatientStats {
            total: count(&self.db, &q).await?,
            by_gender: group_counts(&self.db, &q, "gender").await?,
            by_treatment: group_counts(&self.db, &q, "treatment_type").await?,
        })
    }
}
