// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync triggers and status. Any member of the clinic may sync it.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::{ApiError, ApiResult, AppState, Tenant};
use crate::sync::{SyncMode, SyncReport, SyncStatusReport, SyncTable, TableSyncReport};

#[derive(Debug, Serialize)]
struct PassResponse {
    success: bool,
    message: String,
    results: SyncReport,
}

#[derive(Debug, Serialize)]
struct TableResponse {
    success: bool,
    message: String,
    stats: TableSyncReport,
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/sync/full", post(full))
        .route("/sync/incremental", post(incremental))
        .route("/sync/status", get(status))
        .route("/sync/table/{name}", post(table))
}

async fn full(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<PassResponse>> {
    pass(&state, &tenant, SyncMode::Full).await
}

async fn incremental(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<PassResponse>> {
    pass(&state, &tenant, SyncMode::Incremental).await
}

async fn pass(state: &AppState, tenant: &Tenant, mode: SyncMode) -> ApiResult<Json<PassResponse>> {
    state.sync.register_session(&tenant.0);
    let results = tenant.run(state.sync.sync_all(&tenant.0, mode)).await?;
    let message = match mode {
        SyncMode::Full => "Full sync completed",
        SyncMode::Incremental => "Incremental sync completed",
    };
    Ok(Json(PassResponse { success: results.is_clean(), message: message.into(), results }))
}

async fn status(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<SyncStatusReport>> {
    tenant.run(state.sync.status(&tenant.0)).await.map(Json)
}

async fn table(State(state): State<AppState>, tenant: Tenant, Path(name): Path<String>) -> ApiResult<Json<TableResponse>> {
    let table = SyncTable::parse(&name).ok_or_else(|| ApiError::BadRequest(format!("Table {name} is not syncable")))?;
    let stats = tenant.run(state.sync.sync_table(&tenant.0, table, SyncMode::Incremental)).await?;
    Ok(Json(TableResponse {
        success: stats.errors.is_empty(),
        message: format!("Synced {table}"),
        stats,
    }))
}
