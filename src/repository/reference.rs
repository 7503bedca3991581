// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-clinic reference data: priced catalogues (scan types, treatment
//! types) and referring doctors.

use sqlx::any::AnyRow;

use super::{apply_patch, delete_row, fetch_all, fetch_one, insert_row, marker, require_non_empty, track, Patch};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    CatalogItem, CreateCatalogItem, CreateReferringDoctor, ReferringDoctor, UpdateCatalogItem, UpdateReferringDoctor,
};
use crate::tenant::TenantContext;

const CATALOG_COLUMNS: &str = "id, clinic_id, name, price, is_active, created_at, updated_at, synced_at, sync_status";

fn catalog_from_row(row: &AnyRow) -> Result<CatalogItem, StorageError> {
    Ok(CatalogItem {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        name: db::text(row, "name")?,
        price: db::real(row, "price")?,
        is_active: db::flag(row, "is_active")?,
        marker: marker(row)?,
    })
}

fn check_price(price: f64) -> CoreResult<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(CoreError::Validation("price must be zero or positive".into()));
    }
    Ok(())
}

/// One of the two catalogue tables.
#[derive(Debug, Clone)]
pub struct CatalogRepository {
    db: Database,
    table: &'static str,
    entity: &'static str,
}

impl CatalogRepository {
    #[must_use]
    pub fn scan_types(db: Database) -> Self {
        Self { db, table: "scan_types", entity: "scan type" }
    }

    #[must_use]
    pub fn treatment_types(db: Database) -> Self {
        Self { db, table: "treatment_types", entity: "treatment type" }
    }

    /// Alphabetical. Inactive entries are included only when asked.
    pub async fn list(&self, ctx: &TenantContext, include_inactive: bool) -> CoreResult<Vec<CatalogItem>> {
        let mut q = ScopedQuery::new(ctx, self.table);
        if !include_inactive {
            q = q.eq("is_active", true);
        }
        let q = q.order_by("name ASC, id ASC");
        track(self.table, "list", fetch_all(&self.db, q, CATALOG_COLUMNS, catalog_from_row).await)
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<CatalogItem> {
        let q = ScopedQuery::new(ctx, self.table).eq("id", id);
        track(self.table, "get", fetch_one(&self.db, q, CATALOG_COLUMNS, catalog_from_row, self.entity, id).await)
    }

    pub async fn create(&self, ctx: &TenantContext, input: CreateCatalogItem) -> CoreResult<CatalogItem> {
        require_non_empty("name", &input.name)?;
        check_price(input.price)?;
        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("name", input.name.trim().into()),
            ("price", input.price.into()),
            ("is_active", true.into()),
        ];
        track(self.table, "create", insert_row(&self.db, self.table, values, CATALOG_COLUMNS, catalog_from_row).await)
    }

    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdateCatalogItem) -> CoreResult<CatalogItem> {
        if let Some(name) = patch.name.as_deref() {
            require_non_empty("name", name)?;
        }
        if let Some(price) = patch.price {
            check_price(price)?;
        }
        let changes = Patch::new().set("name", patch.name).set("price", patch.price).set("is_active", patch.is_active);
        let q = ScopedQuery::new(ctx, self.table).eq("id", id);
        let result = apply_patch(&self.db, q, changes, CATALOG_COLUMNS, catalog_from_row, self.entity, id).await;
        track(self.table, "update", result)
    }

    /// Hard delete; referenced entries fail with `InvalidReference` and
    /// should be deactivated instead.
    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, self.table).eq("id", id);
        track(self.table, "delete", delete_row(&self.db, q, self.entity, id).await)
    }
}

const DOCTORS: &str = "referring_doctors";

const DOCTOR_COLUMNS: &str = "id, clinic_id, name, hospital, phone, is_active, created_at, updated_at, synced_at, sync_status";

fn doctor_from_row(row: &AnyRow) -> Result<ReferringDoctor, StorageError> {
    Ok(ReferringDoctor {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        name: db::text(row, "name")?,
        hospital: db::opt_text(row, "hospital")?,
        phone: db::opt_text(row, "phone")?,
        is_active: db::flag(row, "is_active")?,
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct ReferringDoctorRepository {
    db: Database,
}

impl ReferringDoctorRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list(&self, ctx: &TenantContext, include_inactive: bool) -> CoreResult<Vec<ReferringDoctor>> {
        let mut q = ScopedQuery::new(ctx, DOCTORS);
        if !include_inactive {
            q = q.eq("is_active", true);
        }
        let q = q.order_by("name ASC, id ASC");
        track(DOCTORS, "list", fetch_all(&self.db, q, DOCTOR_COLUMNS, doctor_from_row).await)
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<ReferringDoctor> {
        let q = ScopedQuery::new(ctx, DOCTORS).eq("id", id);
        track(DOCTORS, "get", fetch_one(&self.db, q, DOCTOR_COLUMNS, doctor_from_row, "referring doctor", id).await)
    }

    pub async fn create(&self, ctx: &TenantContext, input: CreateReferringDoctor) -> CoreResult<ReferringDoctor> {
        require_non_empty("name", &input.name)?;
        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("name", input.name.trim().into()),
            ("hospital", input.hospital.into()),
            ("phone", input.phone.into()),
            ("is_active", true.into()),
        ];
        track(DOCTORS, "create", insert_row(&self.db, DOCTORS, values, DOCTOR_COLUMNS, doctor_from_row).await)
    }

    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdateReferringDoctor) -> CoreResult<ReferringDoctor> {
        if let Some(name) = patch.name.as_deref() {
            require_non_empty("name", name)?;
        }
        let changes = Patch::new()
            .set("name", patch.name)
            .set("hospital", patch.hospital)
            .set("phone", patch.phone)
            .set("is_active", patch.is_active);
        let q = ScopedQuery::new(ctx, DOCTORS).eq("id", id);
        let result = apply_patch(&self.db, q, changes, DOCTOR_COLUMNS, doctor_from_row, "referring doctor", id).await;
        track(DOCTORS, "update", result)
    }

    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, DOCTORS).eq("id", id);
        track(DOCTORS, "delete", delete_row(&self.db, q, "referring doctor", id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing::store;

    fn item(name: &str, price: f64) -> CreateCatalogItem {
        CreateCatalogItem { name: name.into(), price }
    }

    #[tokio::test]
    async fn test_catalog_tables_are_independent() {
        let (_dir, db) = store().await;
        let scans = CatalogRepository::scan_types(db.clone());
        let treatments = CatalogRepository::treatment_types(db);
        let ctx = TenantContext::for_tests(1);

        scans.create(&ctx, item("OPG", 400.0)).await.unwrap();
        treatments.create(&ctx, item("Root canal", 3500.0)).await.unwrap();

        let listed = scans.list(&ctx, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "OPG");
        assert!(listed[0].is_active);
    }

    #[tokio::test]
    async fn test_deactivated_items_are_hidden_by_default() {
        let (_dir, db) = store().await;
        let scans = CatalogRepository::scan_types(db);
        let ctx = TenantContext::for_tests(1);
        let cbct = scans.create(&ctx, item("CBCT", 2500.0)).await.unwrap();
        scans.create(&ctx, item("Bitewing", 150.0)).await.unwrap();

        let patch = UpdateCatalogItem { is_active: Some(false), ..Default::default() };
        let updated = scans.update(&ctx, cbct.id, patch).await.unwrap();
        assert!(!updated.is_active);

        let names: Vec<String> = scans.list(&ctx, false).await.unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Bitewing".to_string()]);
        assert_eq!(scans.list(&ctx, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_negative_price_rejected() {
        let (_dir, db) = store().await;
        let scans = CatalogRepository::scan_types(db);
        let result = scans.create(&TenantContext::for_tests(1), item("IOPA", -1.0)).await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_referring_doctor_scoped_to_clinic() {
        let (_dir, db) = store().await;
        let repo = ReferringDoctorRepository::new(db);
        let doc = repo
            .create(&TenantContext::for_tests(1), CreateReferringDoctor { name: "Dr. Rao".into(), hospital: None, phone: None })
            .await
            .unwrap();

        let other = TenantContext::for_tests(2);
        assert!(matches!(repo.get_by_id(&other, doc.id).await, Err(CoreError::NotFound { .. })));
        assert!(matches!(repo.delete(&other, doc.id).await, Err(CoreError::NotFound { .. })));
        repo.delete(&TenantContext::for_tests(1), doc.id).await.unwrap();
    }
}
