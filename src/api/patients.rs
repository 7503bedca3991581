// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Patients and the referring doctors attached to them.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};

use super::{ApiResult, AppState, CatalogQuery, Tenant};
use crate::models::{
    CreatePatient, CreateReferringDoctor, PaginatedResult, Pagination, Patient, PatientFilter, ReferringDoctor,
    UpdatePatient, UpdateReferringDoctor,
};
use crate::permissions::{Action, Section};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", get(list).post(create))
        .route("/patients/{id}", get(show).put(update).delete(remove))
        .route("/referring-doctors", get(list_doctors).post(create_doctor))
        .route("/referring-doctors/{id}", put(update_doctor).delete(remove_doctor))
}

async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(filter): Query<PatientFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Patient>>> {
    let ctx = tenant.require(Section::Patients, Action::View)?;
    tenant.run(state.repos.patients.list(ctx, &filter, &page)).await.map(Json)
}

async fn show(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<Patient>> {
    let ctx = tenant.require(Section::Patients, Action::View)?;
    tenant.run(state.repos.patients.get_by_id(ctx, id)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreatePatient>,
) -> ApiResult<(StatusCode, Json<Patient>)> {
    let ctx = tenant.require(Section::Patients, Action::Edit)?;
    let patient = tenant.run(state.repos.patients.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

async fn update(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(patch): Json<UpdatePatient>,
) -> ApiResult<Json<Patient>> {
    let ctx = tenant.require(Section::Patients, Action::Edit)?;
    tenant.run(state.repos.patients.update(ctx, id, patch)).await.map(Json)
}

async fn remove(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let ctx = tenant.require(Section::Patients, Action::Delete)?;
    tenant.run(state.repos.patients.delete(ctx, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_doctors(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(q): Query<CatalogQuery>,
) -> ApiResult<Json<Vec<ReferringDoctor>>> {
    let ctx = tenant.require(Section::Patients, Action::View)?;
    tenant.run(state.repos.referring_doctors.list(ctx, q.include_inactive)).await.map(Json)
}

async fn create_doctor(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreateReferringDoctor>,
) -> ApiResult<(StatusCode, Json<ReferringDoctor>)> {
    let ctx = tenant.require(Section::Patients, Action::Edit)?;
    let doctor = tenant.run(state.repos.referring_doctors.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(doctor)))
}

async fn update_doctor(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(patch): Json<UpdateReferringDoctor>,
) -> ApiResult<Json<ReferringDoctor>> {
    let ctx = tenant.require(Section::Patients, Action::Edit)?;
    tenant.run(state.repos.referring_doctors.update(ctx, id, patch)).await.map(Json)
}

async fn remove_doctor(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let ctx = tenant.require(Section::Patients, Action::Delete)?;
    tenant.run(state.repos.referring_doctors.delete(ctx, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
