// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payments and the priced catalogues (scan types, treatment types).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ApiResult, AppState, CatalogQuery, Tenant};
use crate::models::{
    CatalogItem, CreateCatalogItem, CreatePayment, PaginatedResult, Pagination, Payment, PaymentFilter, PaymentStatus,
    UpdateCatalogItem,
};
use crate::permissions::{Action, Section};
use crate::repository::CatalogRepository;

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: PaymentStatus,
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/payments", get(list).post(create))
        .route("/payments/{id}", get(show))
        .route("/payments/{id}/status", post(transition))
        .route("/scan-types", get(list_items::<ScanTypes>).post(create_item::<ScanTypes>))
        .route("/scan-types/{id}", put(update_item::<ScanTypes>).delete(remove_item::<ScanTypes>))
        .route("/treatment-types", get(list_items::<TreatmentTypes>).post(create_item::<TreatmentTypes>))
        .route("/treatment-types/{id}", put(update_item::<TreatmentTypes>).delete(remove_item::<TreatmentTypes>))
}

async fn list(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(filter): Query<PaymentFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResult<Payment>>> {
    let ctx = tenant.require(Section::Billing, Action::View)?;
    tenant.run(state.repos.payments.list(ctx, &filter, &page)).await.map(Json)
}

async fn show(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<Json<Payment>> {
    let ctx = tenant.require(Section::Billing, Action::View)?;
    tenant.run(state.repos.payments.get_by_id(ctx, id)).await.map(Json)
}

async fn create(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreatePayment>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    let ctx = tenant.require(Section::Billing, Action::Edit)?;
    let payment = tenant.run(state.repos.payments.create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn transition(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(change): Json<StatusChange>,
) -> ApiResult<Json<Payment>> {
    let ctx = tenant.require(Section::Billing, Action::Edit)?;
    tenant.run(state.repos.payments.transition(ctx, id, change.status)).await.map(Json)
}

// ── catalogues ──────────────────────────────────────────────────────────

/// Picks one of the priced catalogues out of the shared state.
trait Catalog: Send + Sync + 'static {
    fn repo(state: &AppState) -> &CatalogRepository;
}

struct ScanTypes;
struct TreatmentTypes;

impl Catalog for ScanTypes {
    fn repo(state: &AppState) -> &CatalogRepository {
        &state.repos.scan_types
    }
}

impl Catalog for TreatmentTypes {
    fn repo(state: &AppState) -> &CatalogRepository {
        &state.repos.treatment_types
    }
}

async fn list_items<C: Catalog>(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(q): Query<CatalogQuery>,
) -> ApiResult<Json<Vec<CatalogItem>>> {
    let ctx = tenant.require(Section::Billing, Action::View)?;
    tenant.run(C::repo(&state).list(ctx, q.include_inactive)).await.map(Json)
}

async fn create_item<C: Catalog>(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(input): Json<CreateCatalogItem>,
) -> ApiResult<(StatusCode, Json<CatalogItem>)> {
    let ctx = tenant.require(Section::Billing, Action::Edit)?;
    let item = tenant.run(C::repo(&state).create(ctx, input)).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_item<C: Catalog>(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<i64>,
    Json(patch): Json<UpdateCatalogItem>,
) -> ApiResult<Json<CatalogItem>> {
    let ctx = tenant.require(Section::Billing, Action::Edit)?;
    tenant.run(C::repo(&state).update(ctx, id, patch)).await.map(Json)
}

async fn remove_item<C: Catalog>(State(state): State<AppState>, tenant: Tenant, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    let ctx = tenant.require(Section::Billing, Action::Delete)?;
    tenant.run(C::repo(&state).delete(ctx, id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
