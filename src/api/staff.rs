// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staff accounts, their enrolled devices and attendance.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ApiResult, AppState, Tenant};
use crate::models::{
    Attendance, AttendanceFilter, CreateUser, EnrollDevice, PaginatedResult, Pagination, User, UserDevice,
};
use crate::permissions::{Action, PermissionMap, Section};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeviceQuery {
    user_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckIn {
    notes: Option<String>,
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/staff", get(list).post(create))
        .route("/staff/{id}/permissions", put(set_permissions))
        .route("/staff/{id}", delete(deactivate))
        .route("/devices", get(list_devices).post(enroll))
        .route("/devices/{id}", delete(remove_device))
        .route("/attendance", get(attendance))
        .route("/attendance/check-in", post(check_in))
        .route("/attendance/check-out", post(check_out))
}

async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<User>>> {
    let ctx = tenant.require(Section::Staff, Action::View)?;
    tenant.run(state.repos.users.list(ctx, &page)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreateUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let ctx = tenant.require(Section::Staff, Action::Edit)?;
    let user = tenant.run(state.repos.users.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn set_permissions(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(permissions): Json<PermissionMap>,
) -> ApiResult<Json<User>> {
    let ctx = tenant.require(Section::Staff, Action::Edit)?;
    tenant.run(state.repos.users.update_permissions(ctx, id, permissions)).await.map(Json)
}

async fn deactivate(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<User>> {
    let ctx = tenant.require(Section::Staff, Action::Delete)?;
    let user = tenant.run(state.repos.users.deactivate(ctx, id)).await?;
    state.sync.unregister_session(id, ctx.clinic_id());
    Ok(Json(user))
}

async fn list_devices(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(q): Query<DeviceQuery>,
) -> ApiResult<Json<Vec<UserDevice>>> {
    let ctx = tenant.require(Section::Staff, Action::View)?;
    tenant.run(state.repos.devices.list(ctx, q.user_id)).await.map(Json)
}

async fn enroll(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<EnrollDevice>,
) -> ApiResult<(StatusCode, Json<UserDevice>)> {
    let ctx = tenant.require(Section::Staff, Action::Edit)?;
    let device = tenant.run(state.repos.devices.enroll(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn remove_device(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<UserDevice>> {
    let ctx = tenant.require(Section::Staff, Action::Delete)?;
    tenant.run(state.repos.devices.deactivate(ctx, id)).await.map(Json)
}

async fn attendance(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(filter): Query<AttendanceFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Attendance>>> {
    let ctx = tenant.require(Section::Attendance, Action::View)?;
    tenant.run(state.repos.attendance.list(ctx, &filter, &page)).await.map(Json)
}

/// Self-service: any member of the clinic records their own attendance.
async fn check_in(
    State(state): State<AppState>,
    tenant: Tenant,
    body: Option<Json<CheckIn>>,
) -> ApiResult<(StatusCode, Json<Attendance>)> {
    let notes = body.and_then(|Json(b)| b.notes);
    let row = tenant.run(state.repos.attendance.check_in(&tenant.0, notes)).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn check_out(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<Attendance>> {
    tenant.run(state.repos.attendance.check_out(&tenant.0)).await.map(Json)
}
