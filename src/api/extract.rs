// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::future::Future;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::error::CoreResult;
use crate::permissions::{self, Action, Section};
use crate::tenant::TenantContext;

/// The caller's resolved tenant context.
#[derive(Debug, Clone)]
pub struct Tenant(pub TenantContext);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let ctx = state.resolver.resolve(header).await?;
        Ok(Tenant(ctx))
    }
}

impl Tenant {
    /// Check the caller may perform `action` in `section`.
    pub fn require(&self, section: Section, action: Action) -> ApiResult<&TenantContext> {
        permissions::require(self.0.user(), section, action)?;
        Ok(&self.0)
    }

    /// Run one core operation under the request deadline.
    pub async fn run<T, F>(&self, op: F) -> ApiResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        match self.0.remaining() {
            Some(left) => tokio::time::timeout(left, op).await.map_err(|_| ApiError::Timeout)?.map_err(ApiError::from),
            None => op.await.map_err(ApiError::from),
        }
    }
}
