// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use super::{ApiResult, AppState, Tenant};
use crate::models::{Clinic, ClinicStats, UpdateClinic};
use crate::permissions::{Action, Section};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/clinic", get(show).put(update))
        .route("/clinic/stats", get(stats))
}

async fn show(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<Clinic>> {
    let ctx = tenant.require(Section::Settings, Action::View)?;
    tenant.run(state.repos.clinics.get(ctx)).await.map(Json)
}

async fn update(State(state): State<AppState>, tenant: Tenant, Json(patch): Json<UpdateClinic>) -> ApiResult<Json<Clinic>> {
    let ctx = tenant.require(Section::Settings, Action::Edit)?;
    tenant.run(state.repos.clinics.update(ctx, patch)).await.map(Json)
}

async fn stats(State(state): State<AppState>, tenant: Tenant) -> ApiResult<Json<ClinicStats>> {
    let ctx = tenant.require(Section::Settings, Action::View)?;
    tenant.run(state.repos.clinics.stats(ctx)).await.map(Json)
}
