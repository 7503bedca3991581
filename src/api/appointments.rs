// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ApiResult, AppState, Tenant};
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, CreateAppointment, PaginatedResult, Pagination,
    UpdateAppointment,
};
use crate::permissions::{Action, Section};

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: AppointmentStatus,
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list).post(create))
        .route("/appointments/{id}", get(show).put(update))
        .route("/appointments/{id}/status", post(set_status))
}

async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(filter): Query<AppointmentFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Appointment>>> {
    let ctx = tenant.require(Section::Appointments, Action::View)?;
    tenant.run(state.repos.appointments.list(ctx, &filter, &page)).await.map(Json)
}

async fn show(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<Appointment>> {
    let ctx = tenant.require(Section::Appointments, Action::View)?;
    tenant.run(state.repos.appointments.get_by_id(ctx, id)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreateAppointment>,
) -> ApiResult<(StatusCode, Json<Appointment>)> {
    let ctx = tenant.require(Section::Appointments, Action::Edit)?;
    let appointment = tenant.run(state.repos.appointments.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(appointment)))
}

async fn update(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(patch): Json<UpdateAppointment>,
) -> ApiResult<Json<Appointment>> {
    let ctx = tenant.require(Section::Appointments, Action::Edit)?;
    tenant.run(state.repos.appointments.update(ctx, id, patch)).await.map(Json)
}

async fn set_status(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(change): Json<StatusChange>,
) -> ApiResult<Json<Appointment>> {
    let ctx = tenant.require(Section::Appointments, Action::Edit)?;
    tenant.run(state.repos.appointments.set_status(ctx, id, change.status)).await.map(Json)
}
