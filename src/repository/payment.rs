// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use sqlx::any::AnyRow;
use tracing::{info, instrument};

use super::{
    apply_patch, count, delete_row, ensure_owned, fetch_one, fetch_page, insert_row, marker, require_non_empty, sum, track,
    Patch,
};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::ids::{IdGenerator, RecordType};
use crate::models::{
    CreatePayment, PaginatedResult, Pagination, Payment, PaymentFilter, PaymentStatus, RevenueSummary, UpdatePayment,
};
use crate::tenant::TenantContext;

const ENTITY: &str = "payments";

const COLUMNS: &str = "id, clinic_id, patient_id, report_id, treatment_type_id, display_id, amount, payment_method, \
                       status, transaction_id, notes, paid_by, received_by, created_at, updated_at, synced_at, sync_status";

fn from_row(row: &AnyRow) -> Result<Payment, StorageError> {
    let status = db::text(row, "status")?;
    Ok(Payment {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        patient_id: db::int(row, "patient_id")?,
        report_id: db::opt_int(row, "report_id")?,
        treatment_type_id: db::opt_int(row, "treatment_type_id")?,
        display_id: db::text(row, "display_id")?,
        amount: db::real(row, "amount")?,
        payment_method: db::text(row, "payment_method")?,
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
        transaction_id: db::opt_text(row, "transaction_id")?,
        notes: db::opt_text(row, "notes")?,
        paid_by: db::opt_text(row, "paid_by")?,
        received_by: db::opt_int(row, "received_by")?,
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    db: Database,
    ids: IdGenerator,
}

impl PaymentRepository {
    #[must_use]
    pub fn new(db: Database, ids: IdGenerator) -> Self {
        Self { db, ids }
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<Payment> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "payment", id).await)
    }

    pub async fn list(&self, ctx: &TenantContext, filter: &PaymentFilter, page: &Pagination) -> CoreResult<PaginatedResult<Payment>> {
        let q = ScopedQuery::new(ctx, ENTITY)
            .eq_opt("patient_id", filter.patient_id)
            .eq_opt("status", filter.status.map(PaymentStatus::as_str));
        track(ENTITY, "list", fetch_page(&self.db, q, COLUMNS, "created_at DESC, id DESC", page, from_row).await)
    }

    /// Record a payment received by the calling user. Only `pending` and
    /// `success` are valid starting states.
    #[instrument(skip(self, ctx, input), fields(clinic_id = ctx.clinic_id()))]
    pub async fn create(&self, ctx: &TenantContext, input: CreatePayment) -> CoreResult<Payment> {
        if !input.amount.is_finite() || input.amount <= 0.0 {
            return Err(CoreError::Validation("amount must be a positive number".into()));
        }
        require_non_empty("payment_method", &input.payment_method)?;
        let status = input.status.unwrap_or(PaymentStatus::Pending);
        if !matches!(status, PaymentStatus::Pending | PaymentStatus::Success) {
            return Err(CoreError::Validation(format!("a payment cannot start as {status}")));
        }

        ensure_owned(&self.db, ScopedQuery::new(ctx, "patients").eq("id", input.patient_id), "patient", input.patient_id).await?;
        if let Some(report_id) = input.report_id {
            let q = ScopedQuery::new(ctx, "reports").eq("id", report_id).eq("patient_id", input.patient_id);
            ensure_owned(&self.db, q, "report", report_id).await?;
        }
        if let Some(tt) = input.treatment_type_id {
            ensure_owned(&self.db, ScopedQuery::new(ctx, "treatment_types").eq("id", tt), "treatment type", tt).await?;
        }

        let result = self
            .ids
            .issue(RecordType::Payment, |display_id| {
                let values: Vec<(&'static str, SqlParam)> = vec![
                    ("clinic_id", ctx.clinic_id().into()),
                    ("patient_id", input.patient_id.into()),
                    ("report_id", input.report_id.into()),
                    ("treatment_type_id", input.treatment_type_id.into()),
                    ("display_id", display_id.to_string().into()),
                    ("amount", input.amount.into()),
                    ("payment_method", input.payment_method.trim().into()),
                    ("status", status.as_str().into()),
                    ("transaction_id", input.transaction_id.clone().into()),
                    ("notes", input.notes.clone().into()),
                    ("paid_by", input.paid_by.clone().into()),
                    ("received_by", ctx.user_id().into()),
                ];
                insert_row(&self.db, ENTITY, values, COLUMNS, from_row)
            })
            .await;
        let payment = track(ENTITY, "create", result)?;
        info!(payment_id = payment.id, display_id = %payment.display_id, amount = payment.amount, "payment recorded");
        Ok(payment)
    }

    /// Descriptive fields only; amount and status have their own paths.
    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdatePayment) -> CoreResult<Payment> {
        if let Some(method) = patch.payment_method.as_deref() {
            require_non_empty("payment_method", method)?;
        }
        let changes = Patch::new()
            .set("payment_method", patch.payment_method)
            .set("transaction_id", patch.transaction_id)
            .set("notes", patch.notes)
            .set("paid_by", patch.paid_by);
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "update", apply_patch(&self.db, q, changes, COLUMNS, from_row, "payment", id).await)
    }

    /// Move along pending → success | failed, success → refunded.
    ///
    /// The UPDATE is conditioned on the status that was read, so two racing
    /// transitions cannot both apply.
    pub async fn transition(&self, ctx: &TenantContext, id: i64, next: PaymentStatus) -> CoreResult<Payment> {
        let current = self.get_by_id(ctx, id).await?;
        if !current.status.can_transition_to(next) {
            return track(ENTITY, "transition", Err(CoreError::Conflict { field: "status".into() }));
        }
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", current.status.as_str());
        let changes = Patch::new().set_value("status", next.as_str());
        let result = match apply_patch(&self.db, q, changes, COLUMNS, from_row, "payment", id).await {
            // Lost the race to another transition
            Err(CoreError::NotFound { .. }) => Err(CoreError::Conflict { field: "status".into() }),
            other => other,
        };
        let payment = track(ENTITY, "transition", result)?;
        info!(payment_id = id, from = %current.status, to = %next, "payment status changed");
        Ok(payment)
    }

    /// Pending payments only.
    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", PaymentStatus::Pending.as_str());
        let mut result = delete_row(&self.db, q, "payment", id).await;
        if matches!(result, Err(CoreError::NotFound { .. }))
            && count(&self.db, &ScopedQuery::new(ctx, ENTITY).eq("id", id)).await? > 0
        {
            result = Err(CoreError::Conflict { field: "status".into() });
        }
        track(ENTITY, "delete", result)
    }

    /// Totals by outcome. Failed payments count toward `payments` only.
    pub async fn revenue(&self, ctx: &TenantContext) -> CoreResult<RevenueSummary> {
        let by_status = |status: PaymentStatus| ScopedQuery::new(ctx, ENTITY).eq("status", status.as_str());
        Ok(RevenueSummary {
            collected: sum(&self.db, &by_status(PaymentStatus::Success), "amount").await?,
            pending: sum(&self.db, &by_status(PaymentStatus::Pending), "amount").await?,
            refunded: sum(&self.db, &by_status(PaymentStatus::Refunded), "amount").await?,
            payments: count(&self.db, &ScopedQuery::new(ctx, ENTITY)).await?,
        })
    }
}
