// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contracts for services the core calls out to but does not implement:
//! object storage for rendered report files and the messaging bridge that
//! delivers them to patients.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::{Report, ReportArtifacts, ReportStatus};
use crate::repository::ReportRepository;
use crate::tenant::TenantContext;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

impl From<CollaboratorError> for CoreError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unavailable(msg) => CoreError::Unavailable(msg),
            CollaboratorError::Rejected(msg) => CoreError::Validation(msg),
        }
    }
}

/// Blob storage for generated documents.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `path` and return a URL the client can fetch.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, CollaboratorError>;
}

/// What the bridge reports back for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub message_id: String,
    pub accepted: bool,
}

/// Outbound messaging (email, WhatsApp).
#[async_trait]
pub trait MessageBridge: Send + Sync {
    async fn send(&self, to: &str, payload: &Value) -> Result<Delivery, CollaboratorError>;
}

/// Upload the rendered PDF of a draft report and finalize it with the
/// returned URL.
#[instrument(skip(storage, reports, ctx, pdf), fields(clinic_id = ctx.clinic_id()))]
pub async fn publish_report(
    storage: &dyn ObjectStorage,
    reports: &ReportRepository,
    ctx: &TenantContext,
    id: i64,
    pdf: Vec<u8>,
) -> CoreResult<Report> {
    let report = reports.get_by_id(ctx, id).await?;
    if report.status != ReportStatus::Draft {
        return Err(CoreError::Conflict { field: "status".into() });
    }

    let path = format!("reports/{}/{}.pdf", ctx.clinic_id(), report.display_id);
    let url = storage.put(&path, pdf, "application/pdf").await?;
    let artifacts = ReportArtifacts { pdf_url: Some(url), ..Default::default() };
    reports.finalize(ctx, id, artifacts).await
}

/// Send a finalized report's link to `to` and count the delivery. A
/// message the bridge did not accept is not counted.
#[instrument(skip(bridge, reports, ctx, to), fields(clinic_id = ctx.clinic_id()))]
pub async fn deliver_report(
    bridge: &dyn MessageBridge,
    reports: &ReportRepository,
    ctx: &TenantContext,
    id: i64,
    to: &str,
) -> CoreResult<(Report, Delivery)> {
    let report = reports.get_by_id(ctx, id).await?;
    let Some(url) = report.pdf_url.as_deref().filter(|_| report.status == ReportStatus::Finalized) else {
        return Err(CoreError::Validation("report has no published document".into()));
    };

    let payload = serde_json::json!({
        "kind": "report",
        "display_id": report.display_id,
        "url": url,
    });
    let delivery = bridge.send(to, &payload).await?;
    if !delivery.accepted {
        warn!(report_id = id, message_id = %delivery.message_id, "bridge did not accept report message");
        return Ok((report, delivery));
    }

    let report = reports.record_send(ctx, id).await?;
    info!(report_id = id, send_count = report.send_count, "report delivered");
    Ok((report, delivery))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::ids::IdGenerator;
    use crate::models::{CreatePatient, CreateReport};
    use crate::repository::testing::store;
    use crate::repository::PatientRepository;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryStorage {
        objects: Mutex<Vec<(String, usize, String)>>,
    }

    #[async_trait]
    impl ObjectStorage for MemoryStorage {
        async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, CollaboratorError> {
            self.objects.lock().push((path.to_string(), bytes.len(), content_type.to_string()));
            Ok(format!("https://files.test/{path}"))
        }
    }

    struct Bridge {
        accept: bool,
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl MessageBridge for Bridge {
        async fn send(&self, to: &str, payload: &Value) -> Result<Delivery, CollaboratorError> {
            let mut sent = self.sent.lock();
            sent.push((to.to_string(), payload.clone()));
            Ok(Delivery { message_id: format!("m{}", sent.len()), accepted: self.accept })
        }
    }

    struct Down;

    #[async_trait]
    impl ObjectStorage for Down {
        async fn put(&self, _: &str, _: Vec<u8>, _: &str) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::Unavailable("bucket offline".into()))
        }
    }

    async fn draft() -> (tempfile::TempDir, ReportRepository, i64) {
        let (dir, db) = store().await;
        let ids = IdGenerator::new(db.clone(), 5);
        let patients = PatientRepository::new(db.clone(), ids.clone(), Cache::disabled());
        let ctx = TenantContext::for_tests(1);
        let p = patients.create(&ctx, CreatePatient { name: "Asha".into(), ..Default::default() }).await.unwrap();
        let reports = ReportRepository::new(db, ids);
        let r = reports.create(&ctx, CreateReport { patient_id: p.id, content: Some("Normal".into()) }).await.unwrap();
        (dir, reports, r.id)
    }

    #[tokio::test]
    async fn test_publish_uploads_and_finalizes() {
        let (_dir, reports, id) = draft().await;
        let storage = MemoryStorage::default();
        let ctx = TenantContext::for_tests(1);

        let report = publish_report(&storage, &reports, &ctx, id, vec![0x25, 0x50, 0x44, 0x46]).await.unwrap();
        assert_eq!(report.status, ReportStatus::Finalized);
        let url = report.pdf_url.unwrap();
        assert!(url.ends_with(&format!("reports/1/{}.pdf", report.display_id)));

        let objects = storage.objects.lock();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].1, 4);
        assert_eq!(objects[0].2, "application/pdf");
    }

    #[tokio::test]
    async fn test_publish_twice_is_conflict() {
        let (_dir, reports, id) = draft().await;
        let storage = MemoryStorage::default();
        let ctx = TenantContext::for_tests(1);
        publish_report(&storage, &reports, &ctx, id, vec![1]).await.unwrap();

        let again = publish_report(&storage, &reports, &ctx, id, vec![1]).await;
        assert!(matches!(again, Err(CoreError::Conflict { .. })));
        assert_eq!(storage.objects.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_outage_leaves_draft() {
        let (_dir, reports, id) = draft().await;
        let ctx = TenantContext::for_tests(1);
        let result = publish_report(&Down, &reports, &ctx, id, vec![1]).await;
        assert!(matches!(result, Err(CoreError::Unavailable(_))));
        assert_eq!(reports.get_by_id(&ctx, id).await.unwrap().status, ReportStatus::Draft);
    }

    #[tokio::test]
    async fn test_deliver_counts_accepted_messages_only() {
        let (_dir, reports, id) = draft().await;
        let ctx = TenantContext::for_tests(1);

        let bridge = Bridge { accept: true, sent: Mutex::default() };
        let early = deliver_report(&bridge, &reports, &ctx, id, "+910000000000").await;
        assert!(matches!(early, Err(CoreError::Validation(_))));

        publish_report(&MemoryStorage::default(), &reports, &ctx, id, vec![1]).await.unwrap();
        let (report, delivery) = deliver_report(&bridge, &reports, &ctx, id, "+910000000000").await.unwrap();
        assert!(delivery.accepted);
        assert_eq!(report.send_count, 1);
        assert_eq!(bridge.sent.lock()[0].1["kind"], "report");

        let refusing = Bridge { accept: false, sent: Mutex::default() };
        let (report, _) = deliver_report(&refusing, &reports, &ctx, id, "+910000000000").await.unwrap();
        assert_eq!(report.send_count, 1);
    }

    #[tokio::test]
    async fn test_other_clinic_cannot_publish() {
        let (_dir, reports, id) = draft().await;
        let result = publish_report(&MemoryStorage::default(), &reports, &TenantContext::for_tests(2), id, vec![1]).await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }
}
