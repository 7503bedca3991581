// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The tenant row itself. Clinic-scoped operations address the caller's
//! clinic only; `search` and `create` are platform-level.

use sqlx::any::AnyRow;
use tracing::{info, instrument, warn};

use super::user::attach_to_clinic;
use super::{apply_patch, count, fetch_one, insert_row, marker, require_non_empty, sum, track, Patch};
use crate::cache::{keys, Cache};
use crate::db::query::{escape_like, ScopedQuery, SqlParam};
use crate::db::{self, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::{Clinic, ClinicStats, ClinicStatus, CreateClinic, PaginatedResult, Pagination, PaymentStatus, ReportStatus, UpdateClinic};
use crate::permissions::Role;
use crate::tenant::TenantContext;

const ENTITY: &str = "clinics";

const COLUMNS: &str = "id, name, address, phone, email, gst_number, specialization, subscription_plan, status, \
                       created_at, updated_at, synced_at, sync_status";

fn from_row(row: &AnyRow) -> Result<Clinic, StorageError> {
    let status = db::text(row, "status")?;
    Ok(Clinic {
        id: db::int(row, "id")?,
        name: db::text(row, "name")?,
        address: db::opt_text(row, "address")?,
        phone: db::opt_text(row, "phone")?,
        email: db::opt_text(row, "email")?,
        gst_number: db::opt_text(row, "gst_number")?,
        specialization: db::text(row, "specialization")?,
        subscription_plan: db::text(row, "subscription_plan")?,
        status: ClinicStatus::parse(&status).unwrap_or(ClinicStatus::Suspended),
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct ClinicRepository {
    db: Database,
    cache: Cache,
}

impl ClinicRepository {
    #[must_use]
    pub fn new(db: Database, cache: Cache) -> Self {
        Self { db, cache }
    }

    /// The caller's clinic, cached for the clinic TTL.
    pub async fn get(&self, ctx: &TenantContext) -> CoreResult<Clinic> {
        let key = keys::clinic(ctx.clinic_id());
        if let Some(hit) = self.cache.get_json::<Clinic>(&key).await {
            return Ok(hit);
        }
        let q = ScopedQuery::clinic(ctx);
        let clinic = track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "clinic", ctx.clinic_id()).await)?;
        self.cache.set_json(&key, &clinic, self.cache.clinic_ttl()).await;
        Ok(clinic)
    }

    pub async fn update(&self, ctx: &TenantContext, patch: UpdateClinic) -> CoreResult<Clinic> {
        if let Some(name) = patch.name.as_deref() {
            require_non_empty("name", name)?;
        }
        let changes = Patch::new()
            .set("name", patch.name)
            .set("address", patch.address)
            .set("phone", patch.phone)
            .set("email", patch.email)
            .set("gst_number", patch.gst_number)
            .set("specialization", patch.specialization)
            .set("subscription_plan", patch.subscription_plan);
        let result = apply_patch(&self.db, ScopedQuery::clinic(ctx), changes, COLUMNS, from_row, "clinic", ctx.clinic_id()).await;
        let clinic = track(ENTITY, "update", result)?;
        self.cache.invalidate_clinic(ctx.clinic_id()).await;
        Ok(clinic)
    }

    /// Soft delete. Tokens for the clinic stop resolving immediately.
    #[instrument(skip(self, ctx), fields(clinic_id = ctx.clinic_id()))]
    pub async fn cancel(&self, ctx: &TenantContext) -> CoreResult<Clinic> {
        let changes = Patch::new().set_value("status", ClinicStatus::Cancelled.as_str());
        let result = apply_patch(&self.db, ScopedQuery::clinic(ctx), changes, COLUMNS, from_row, "clinic", ctx.clinic_id()).await;
        let clinic = track(ENTITY, "cancel", result)?;
        self.cache.invalidate_clinic(ctx.clinic_id()).await;
        warn!(clinic_id = clinic.id, "clinic cancelled");
        Ok(clinic)
    }

    pub async fn stats(&self, ctx: &TenantContext) -> CoreResult<ClinicStats> {
        let scoped = |table: &'static str| ScopedQuery::new(ctx, table);
        let finalized = scoped("reports").eq("status", ReportStatus::Finalized.as_str());
        let collected = scoped("payments").eq("status", PaymentStatus::Success.as_str());
        Ok(ClinicStats {
            patients: count(&self.db, &scoped("patients")).await?,
            reports: count(&self.db, &scoped("reports")).await?,
            finalized_reports: count(&self.db, &finalized).await?,
            payments: count(&self.db, &scoped("payments")).await?,
            appointments: count(&self.db, &scoped("appointments")).await?,
            staff: count(&self.db, &scoped("users").eq("is_active", true)).await?,
            revenue: sum(&self.db, &collected, "amount").await?,
        })
    }

    /// Platform-level name search across all clinics, alphabetical.
    pub async fn search(&self, query: &str, page: &Pagination) -> CoreResult<PaginatedResult<Clinic>> {
        let needle = query.trim();
        let (filter, params): (&str, Vec<SqlParam>) = if needle.is_empty() {
            ("1 = 1", Vec::new())
        } else {
            let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
            ("LOWER(name) LIKE $1 ESCAPE '\\'", vec![pattern.into()])
        };

        let total_row = self.db.fetch_optional(&format!("SELECT COUNT(*) AS n FROM clinics WHERE {filter}"), &params).await?;
        let total = total_row.map(|r| db::int(&r, "n")).transpose()?.unwrap_or(0);
        let sql = format!(
            "SELECT {COLUMNS} FROM clinics WHERE {filter} ORDER BY name ASC, id ASC LIMIT {} OFFSET {}",
            page.limit(),
            page.offset()
        );
        let rows = self.db.fetch_all(&sql, &params).await?;
        let items = rows.iter().map(from_row).collect::<Result<Vec<_>, _>>()?;
        track(ENTITY, "search", Ok(PaginatedResult { items, total, offset: page.offset(), limit: page.limit() }))
    }

    /// Onboarding: create a clinic and make `owner_id` its owner. The owner
    /// must not belong to a clinic yet. If the owner is claimed concurrently
    /// the new clinic is removed again.
    #[instrument(skip(self, input))]
    pub async fn create(&self, owner_id: i64, input: CreateClinic) -> CoreResult<Clinic> {
        require_non_empty("name", &input.name)?;
        let owner = self
            .db
            .fetch_optional("SELECT clinic_id FROM users WHERE id = $1", &[owner_id.into()])
            .await?
            .ok_or_else(|| CoreError::not_found("user", owner_id))?;
        if db::opt_int(&owner, "clinic_id")?.is_some() {
            return track(ENTITY, "create", Err(CoreError::Conflict { field: "clinic_id".into() }));
        }

        let values: Vec<(&'static str, SqlParam)> = vec![
            ("name", input.name.trim().into()),
            ("address", input.address.into()),
            ("phone", input.phone.into()),
            ("email", input.email.into()),
            ("gst_number", input.gst_number.into()),
            ("specialization", input.specialization.unwrap_or_else(|| "dental".into()).into()),
            ("subscription_plan", input.subscription_plan.unwrap_or_else(|| "free".into()).into()),
            ("status", ClinicStatus::Active.as_str().into()),
        ];
        let clinic = track(ENTITY, "create", insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await)?;

        if !attach_to_clinic(&self.db, owner_id, clinic.id, Some(Role::ClinicOwner)).await? {
            // Owner joined another clinic in between; undo
            self.db.execute("DELETE FROM clinics WHERE id = $1", &[clinic.id.into()]).await?;
            return Err(CoreError::Conflict { field: "clinic_id".into() });
        }
        self.cache.invalidate_user(owner_id).await;
        info!(clinic_id = clinic.id, owner_id, "clinic onboarded");
        Ok(clinic)
    }
}
