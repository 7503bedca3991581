// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{ApiResult, AppState, Tenant};
use crate::models::{CreateReport, PaginatedResult, Pagination, Report, ReportArtifacts, ReportFilter, UpdateReport};
use crate::permissions::{Action, Section};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/reports", get(list).post(create))
        .route("/reports/{id}", get(show).put(update))
        .route("/reports/{id}/finalize", post(finalize))
        .route("/reports/{id}/sent", post(sent))
}

async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(filter): Query<ReportFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Report>>> {
    let ctx = tenant.require(Section::Reports, Action::View)?;
    tenant.run(state.repos.reports.list(ctx, &filter, &page)).await.map(Json)
}

async fn show(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<Report>> {
    let ctx = tenant.require(Section::Reports, Action::View)?;
    tenant.run(state.repos.reports.get_by_id(ctx, id)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreateReport>,
) -> ApiResult<(StatusCode, Json<Report>)> {
    let ctx = tenant.require(Section::Reports, Action::Edit)?;
    let report = tenant.run(state.repos.reports.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn update(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(patch): Json<UpdateReport>,
) -> ApiResult<Json<Report>> {
    let ctx = tenant.require(Section::Reports, Action::Edit)?;
    tenant.run(state.repos.reports.update(ctx, id, patch)).await.map(Json)
}

/// Attach the rendered artifacts. Rendering itself happens outside the core.
async fn finalize(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(artifacts): Json<ReportArtifacts>,
) -> ApiResult<Json<Report>> {
    let ctx = tenant.require(Section::Reports, Action::Edit)?;
    tenant.run(state.repos.reports.finalize(ctx, id, artifacts)).await.map(Json)
}

async fn sent(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<Report>> {
    let ctx = tenant.require(Section::Reports, Action::Edit)?;
    tenant.run(state.repos.reports.record_send(ctx, id)).await.map(Json)
}
