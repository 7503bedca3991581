// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{NaiveDate, NaiveTime};
use sqlx::any::AnyRow;

use super::{apply_patch, delete_row, ensure_owned, fetch_all, fetch_one, fetch_page, insert_row, marker, require_non_empty, track, Patch};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, CreateAppointment, PaginatedResult, Pagination, UpdateAppointment,
};
use crate::tenant::TenantContext;

const ENTITY: &str = "appointments";

const COLUMNS: &str = "id, clinic_id, patient_id, patient_name, patient_email, patient_phone, doctor_id, treatment, \
                       appointment_date, start_time, end_time, duration, status, notes, created_by, \
                       created_at, updated_at, synced_at, sync_status";

const SCHEDULE_ORDER: &str = "appointment_date ASC, start_time ASC, id ASC";

fn from_row(row: &AnyRow) -> Result<Appointment, StorageError> {
    let status = db::text(row, "status")?;
    Ok(Appointment {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        patient_id: db::opt_int(row, "patient_id")?,
        patient_name: db::text(row, "patient_name")?,
        patient_email: db::opt_text(row, "patient_email")?,
        patient_phone: db::opt_text(row, "patient_phone")?,
        doctor_id: db::opt_int(row, "doctor_id")?,
        treatment: db::text(row, "treatment")?,
        appointment_date: db::text(row, "appointment_date")?,
        start_time: db::text(row, "start_time")?,
        end_time: db::text(row, "end_time")?,
        duration: db::int(row, "duration")?,
        status: AppointmentStatus::parse(&status).unwrap_or(AppointmentStatus::Confirmed),
        notes: db::opt_text(row, "notes")?,
        created_by: db::opt_int(row, "created_by")?,
        marker: marker(row)?,
    })
}

fn parse_date(value: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| CoreError::Validation(format!("appointment_date '{value}' is not YYYY-MM-DD")))
}

fn parse_time(field: &str, value: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| CoreError::Validation(format!("{field} '{value}' is not HH:MM")))
}

/// Validated slot; returns the duration in minutes.
fn slot_minutes(start: &str, end: &str) -> CoreResult<i64> {
    let start = parse_time("start_time", start)?;
    let end = parse_time("end_time", end)?;
    if end <= start {
        return Err(CoreError::Validation("end_time must be after start_time".into()));
    }
    Ok((end - start).num_minutes())
}

#[derive(Debug, Clone)]
pub struct AppointmentRepository {
    db: Database,
}

impl AppointmentRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<Appointment> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "appointment", id).await)
    }

    pub async fn list(&self, ctx: &TenantContext, filter: &AppointmentFilter, page: &Pagination) -> CoreResult<PaginatedResult<Appointment>> {
        if let Some(date) = filter.date.as_deref() {
            parse_date(date)?;
        }
        let q = ScopedQuery::new(ctx, ENTITY)
            .eq_opt("appointment_date", filter.date.clone())
            .eq_opt("doctor_id", filter.doctor_id)
            .eq_opt("status", filter.status.map(AppointmentStatus::as_str));
        track(ENTITY, "list", fetch_page(&self.db, q, COLUMNS, SCHEDULE_ORDER, page, from_row).await)
    }

    /// The day's schedule in start-time order.
    pub async fn list_for_date(&self, ctx: &TenantContext, date: &str) -> CoreResult<Vec<Appointment>> {
        parse_date(date)?;
        let q = ScopedQuery::new(ctx, ENTITY).eq("appointment_date", date).order_by(SCHEDULE_ORDER);
        track(ENTITY, "list_for_date", fetch_all(&self.db, q, COLUMNS, from_row).await)
    }

    pub async fn create(&self, ctx: &TenantContext, input: CreateAppointment) -> CoreResult<Appointment> {
        require_non_empty("patient_name", &input.patient_name)?;
        parse_date(&input.appointment_date)?;
        let minutes = slot_minutes(&input.start_time, &input.end_time)?;
        self.ensure_references(ctx, input.patient_id, input.doctor_id).await?;

        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("patient_id", input.patient_id.into()),
            ("patient_name", input.patient_name.trim().into()),
            ("patient_email", input.patient_email.into()),
            ("patient_phone", input.patient_phone.into()),
            ("doctor_id", input.doctor_id.into()),
            ("treatment", input.treatment.into()),
            ("appointment_date", input.appointment_date.into()),
            ("start_time", input.start_time.into()),
            ("end_time", input.end_time.into()),
            ("duration", input.duration.unwrap_or(minutes).into()),
            ("status", AppointmentStatus::Confirmed.as_str().into()),
            ("notes", input.notes.into()),
            ("created_by", ctx.user_id().into()),
        ];
        track(ENTITY, "create", insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await)
    }

    /// Reschedule or edit details. A changed slot is validated against the
    /// stored half when only one end moves.
    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdateAppointment) -> CoreResult<Appointment> {
        if let Some(name) = patch.patient_name.as_deref() {
            require_non_empty("patient_name", name)?;
        }
        if let Some(date) = patch.appointment_date.as_deref() {
            parse_date(date)?;
        }
        let mut duration = patch.duration;
        if patch.start_time.is_some() || patch.end_time.is_some() {
            let current = self.get_by_id(ctx, id).await?;
            let start = patch.start_time.as_deref().unwrap_or(&current.start_time);
            let end = patch.end_time.as_deref().unwrap_or(&current.end_time);
            let minutes = slot_minutes(start, end)?;
            duration = duration.or(Some(minutes));
        }
        self.ensure_references(ctx, None, patch.doctor_id).await?;

        let changes = Patch::new()
            .set("patient_name", patch.patient_name)
            .set("patient_email", patch.patient_email)
            .set("patient_phone", patch.patient_phone)
            .set("doctor_id", patch.doctor_id)
            .set("treatment", patch.treatment)
            .set("appointment_date", patch.appointment_date)
            .set("start_time", patch.start_time)
            .set("end_time", patch.end_time)
            .set("duration", duration)
            .set("notes", patch.notes);
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "update", apply_patch(&self.db, q, changes, COLUMNS, from_row, "appointment", id).await)
    }

    /// confirmed → completed | cancelled | no_show. Conditioned on the
    /// status that was read.
    pub async fn set_status(&self, ctx: &TenantContext, id: i64, next: AppointmentStatus) -> CoreResult<Appointment> {
        let current = self.get_by_id(ctx, id).await?;
        if !current.status.can_transition_to(next) {
            return track(ENTITY, "set_status", Err(CoreError::Conflict { field: "status".into() }));
        }
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("status", current.status.as_str());
        let changes = Patch::new().set_value("status", next.as_str());
        let result = match apply_patch(&self.db, q, changes, COLUMNS, from_row, "appointment", id).await {
            Err(CoreError::NotFound { .. }) => Err(CoreError::Conflict { field: "status".into() }),
            other => other,
        };
        track(ENTITY, "set_status", result)
    }

    pub async fn delete(&self, ctx: &TenantContext, id: i64) -> CoreResult<()> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "delete", delete_row(&self.db, q, "appointment", id).await)
    }

    async fn ensure_references(&self, ctx: &TenantContext, patient_id: Option<i64>, doctor_id: Option<i64>) -> CoreResult<()> {
        if let Some(pid) = patient_id {
            ensure_owned(&self.db, ScopedQuery::new(ctx, "patients").eq("id", pid), "patient", pid).await?;
        }
        if let Some(did) = doctor_id {
            ensure_owned(&self.db, ScopedQuery::new(ctx, "users").eq("id", did), "doctor", did).await?;
        }
        Ok(())
    }
}
