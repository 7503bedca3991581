// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ApiResult, AppState};
use crate::tenant::UserPrincipal;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    user: UserPrincipal,
}

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/auth/login", post(login))
}

/// Verify credentials and mint a token. A user attached to an active
/// clinic is also registered with the background sync loop.
async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> ApiResult<Json<LoginResponse>> {
    let user = state.repos.users.authenticate(&body.email, &body.password).await?;
    let token = state.resolver.issue_token(&user)?;

    match state.resolver.context_for(user.id).await {
        Ok(ctx) => state.sync.register_session(&ctx),
        Err(e) => debug!(user_id = user.id, error = %e, "login without sync session"),
    }
    info!(user_id = user.id, clinic_id = ?user.clinic_id, "user logged in");
    Ok(Json(LoginResponse { token, user }))
}
