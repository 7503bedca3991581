// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Radiology/dental reports. A report is editable while `draft`; finalizing
//! freezes its content and artifacts.

use sqlx::any::AnyRow;
use tracing::info;

use super::{apply_patch, count, delete_row, ensure_owned, fetch_one, fetch_page, insert_row, marker, track, Patch};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, now_millis, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::ids::{IdGenerator, RecordType};
use crate::models::{CreateReport, PaginatedResult, Pagination, Report, ReportArtifacts, ReportFilter, ReportStatus, UpdateReport};
use crate::tenant::TenantContext;

const ENTITY: &str = "reports";

const COLUMNS: &str = "id, clinic_id, patient_id, display_id, content, docx_url, pdf_url, status, send_count, \
                       finalized_at, created_at, updated_at, synced_at, sync_status";

fn from_row(row: &AnyRow) -> Result<Report, StorageError> {
    let status = db::text(row, "status")?;
    Ok(Report {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        patient_id: db::int(row, "patient_id")?,
        display_id: db::text(row, "display_id")?,
        content: db::opt_text(row, "content")?,
        docx_url: db::opt_text(row, "docx_url")?,
        pdf_url: db::opt_text(row, "pdf_url")?,
        status: ReportStatus::parse(&status).unwrap_or(ReportStatus::Draft),
        send_count: db::int(row, "send_count")?,
        finalized_at: db::opt_int(row, "finalized_at")?,
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct ReportRepository {
    db: Database,
    ids: IdGenerator,
}

impl ReportRepository {
    #[must_use]
    pub fn new(db: Database, ids: IdGenerator) -> Self {
        Self { db, ids }
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<Report> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "report", id).await)
    }

    pub async fn list(&self, ctx: &TenantContext, filter: &ReportFilter, page: &Pagination) -> CoreResult<PaginatedResult<Report>> {
        let q = ScopedQuery::new(ctx, ENTITY)
            .eq_opt("patient_id", filter.patient_id)
            .eq_opt("status", filter.status.map(ReportStatus::as_str));
        track(ENTITY, "list", fetch_page(&self.db, q, COLUMNS, "created_at DESC, id DESC", page, from_row).await)
    }

    pub async fn create(&self, ctx: &TenantContext, input: CreateReport) -> CoreResult<Report> {
        ensure_owned(&self.db, ScopedQuery::new(ctx, "patients").eq("id", input.patient_id), "patient", input.patient_id).await?;

        let result = self
            .ids
            .issue(RecordType::Report, |display_id| {
                let values: Vec<(&'static str, SqlParam)> = vec![
                    ("clinic_id", ctx.clinic_id().into()),
                    ("patient_id", input.patient_id.into()),
                    ("display_id", display_id.to_string().into()),
                    ("content", input.content.clone().into()),
                    ("status", ReportStatus::Draft.as_str().into()),
                ];
                insert_row(&self.db, ENTITY, values, COLUMNS, from_row)
            })
            .await;
        track(ENTITY, "create", result)
    }

    /// Edit a draft. Finalized reports are immutable.
    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdateReport) -> CoreResult<Report> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", ReportStatus::Draft.as_str());
        let changes = Patch::new().set("content", patch.content);
        let result = apply_patch(&self.db, q, changes, COLUMNS, from_row, "report", id).await;
        track(ENTITY, "update", self.explain_miss(ctx, id, result).await)
    }

    /// draft → finalized, exactly once.
    pub async fn finalize(&self, ctx: &TenantContext, id: i64, artifacts: ReportArtifacts) -> CoreResult<Report> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", ReportStatus::Draft.as_str());
        let changes = Patch::new()
            .set_value("status", ReportStatus::Finalized.as_str())
            .set_value("finalized_at", now_millis())
            .set("docx_url", artifacts.docx_url)
            .set("pdf_url", artifacts.pdf_url)
            .set("content", artifacts.content);
        let result = apply_patch(&self.db, q, changes, COLUMNS, from_row, "report", id).await;
        let report = track(ENTITY, "finalize", self.explain_miss(ctx, id, result).await)?;
        info!(report_id = id, display_id = %report.display_id, "report finalized");
        Ok(report)
    }

    /// Count one delivery of the report to the patient.
    pub async fn record_send(&self, ctx: &TenantContext, id: i64) -> CoreResult<Report> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let changes = Patch::new().expr("send_count = send_count + 1");
        track(ENTITY, "record_send", apply_patch(&self.db, q, changes, COLUMNS, from_row, "report", id).await)
    }

    /// Drafts only.
    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", ReportStatus::Draft.as_str());
        let result = delete_row(&self.db, q, "report", id).await;
        track(ENTITY, "delete", self.explain_miss(ctx, id, result).await)
    }

    /// A draft-only statement that matched nothing: either the report is
    /// missing (or another clinic's) or it is already finalized.
    async fn explain_miss<T>(&self, ctx: &TenantContext, id: i64, result: CoreResult<T>) -> CoreResult<T> {
        match result {
            Err(CoreError::NotFound { .. }) => {
                let exists = count(&self.db, &ScopedQuery::new(ctx, ENTITY).eq("id", id)).await? > 0;
                if exists {
                    Err(CoreError::Conflict { field: "status".into() })
                } else {
                    Err(CoreError::not_found("report", id))
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::models::CreatePatient;
    use crate::repository::testing::store;
    use crate::repository::PatientRepository;

    async fn setup() -> (tempfile::TempDir, ReportRepository, i64) {
        let (dir, db) = store().await;
        let ids = IdGenerator::new(db.clone(), 5);
        let patients = PatientRepository::new(db.clone(), ids.clone(), Cache::disabled());
        let p = patients
            .create(&TenantContext::for_tests(1), CreatePatient { name: "Asha".into(), ..Default::default() })
            .await
            .unwrap();
        (dir, ReportRepository::new(db, ids), p.id)
    }

    #[tokio::test]
    async fn test_finalize_once_then_immutable() {
        let (_dir, repo, patient_id) = setup().await;
        let ctx = TenantContext::for_tests(1);
        let r = repo.create(&ctx, CreateReport { patient_id, content: Some("draft".into()) }).await.unwrap();
        assert!(r.display_id.starts_with("RAD-"));

        let artifacts = ReportArtifacts { pdf_url: Some("s3://r.pdf".into()), ..Default::default() };
        let done = repo.finalize(&ctx, r.id, artifacts).await.unwrap();
        assert_eq!(done.status, ReportStatus::Finalized);
        assert!(done.finalized_at.is_some());
        assert_eq!(done.content.as_deref(), Some("draft"));

        let again = repo.finalize(&ctx, r.id, ReportArtifacts::default()).await;
        assert!(matches!(again, Err(CoreError::Conflict { ref field }) if field == "status"));

        let edit = repo.update(&ctx, r.id, UpdateReport { content: Some("changed".into()) }).await;
        assert!(matches!(edit, Err(CoreError::Conflict { .. })));
        assert!(matches!(repo.delete(&ctx, r.id).await, Err(CoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_record_send_increments() {
        let (_dir, repo, patient_id) = setup().await;
        let ctx = TenantContext::for_tests(1);
        let r = repo.create(&ctx, CreateReport { patient_id, content: None }).await.unwrap();

        repo.record_send(&ctx, r.id).await.unwrap();
        let sent = repo.record_send(&ctx, r.id).await.unwrap();
        assert_eq!(sent.send_count, 2);
    }

    #[tokio::test]
    async fn test_patient_of_other_clinic_is_invalid_reference() {
        let (_dir, repo, patient_id) = setup().await;
        let other = TenantContext::for_tests(2);
        let result = repo.create(&other, CreateReport { patient_id, content: None }).await;
        assert!(matches!(result, Err(CoreError::InvalidReference(_))));
    }

    #[tokio::test]
    async fn test_finalize_of_foreign_report_is_not_found() {
        let (_dir, repo, patient_id) = setup().await;
        let r = repo.create(&TenantContext::for_tests(1), CreateReport { patient_id, content: None }).await.unwrap();
        let result = repo.finalize(&TenantContext::for_tests(2), r.id, ReportArtifacts::default()).await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }
}
