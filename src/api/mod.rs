// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Thin HTTP surface.
//!
//! Every handler follows the same three steps: the [`Tenant`] extractor
//! resolves the bearer token, the handler checks the section permission,
//! then makes one repository or sync call under the request deadline.

mod appointments;
mod auth;
mod billing;
mod clinic;
pub mod error;
pub mod extract;
mod patients;
mod reports;
mod staff;
mod sync;

use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

use crate::cache::Cache;
use crate::db::Database;
use crate::repository::Repositories;
use crate::sync::SyncEngine;
use crate::tenant::TenantResolver;

pub use error::{ApiError, ApiResult};
pub use extract::Tenant;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub repos: Repositories,
    pub sync: Arc<SyncEngine>,
    pub resolver: TenantResolver,
    pub cache: Cache,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &self.db)
            .field("sync", &self.sync)
            .field("cache_enabled", &self.cache.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Query string of the reference-data list routes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CatalogQuery {
    pub include_inactive: bool,
}

/// All routes, bound to `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(auth::router())
        .merge(patients::router())
        .merge(reports::router())
        .merge(billing::router())
        .merge(appointments::router())
        .merge(staff::router())
        .merge(clinic::router())
        .merge(sync::router())
        .with_state(state)
}
