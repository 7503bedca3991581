// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request principal and clinic scope.
//!
//! A [`TenantContext`] is produced only by [`TenantResolver::resolve`] from a
//! bearer token, after the user and its clinic have been checked against the
//! store. Every repository and sync operation takes one, and the clinic it
//! carries cannot be changed afterwards.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::db::{self, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::ClinicStatus;
use crate::permissions::{PermissionMap, Role};

/// The authenticated user as loaded from `users`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPrincipal {
    pub id: i64,
    pub clinic_id: Option<i64>,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub permissions: PermissionMap,
    pub is_active: bool,
}

pub(crate) const PRINCIPAL_COLUMNS: &str = "id, clinic_id, email, name, role, permissions, is_active";

impl UserPrincipal {
    pub(crate) fn from_row(row: &AnyRow) -> Result<Self, StorageError> {
        let role = db::text(row, "role")?;
        let permissions = db::opt_text(row, "permissions")?
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .map(|v| PermissionMap::from_json(&v))
            .unwrap_or_default();

        Ok(Self {
            id: db::int(row, "id")?,
            clinic_id: db::opt_int(row, "clinic_id")?,
            email: db::text(row, "email")?,
            name: db::text(row, "name")?,
            // Unknown roles get the least privileged one
            role: Role::parse(&role).unwrap_or(Role::Receptionist),
            permissions,
            is_active: db::flag(row, "is_active")?,
        })
    }
}

/// Immutable per-request scope.
#[derive(Debug, Clone)]
pub struct TenantContext {
    user: UserPrincipal,
    clinic_id: i64,
    deadline: Option<Instant>,
}

impl TenantContext {
    #[must_use]
    pub fn clinic_id(&self) -> i64 {
        self.clinic_id
    }

    #[must_use]
    pub fn user(&self) -> &UserPrincipal {
        &self.user
    }

    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.user.id
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the request deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(clinic_id: i64) -> Self {
        Self {
            user: UserPrincipal {
                id: 1,
                clinic_id: Some(clinic_id),
                email: "owner@clinic.test".into(),
                name: "Owner".into(),
                role: Role::ClinicOwner,
                permissions: PermissionMap::new(),
                is_active: true,
            },
            clinic_id,
            deadline: None,
        }
    }
}

/// Bearer token claims. `sub` is the user id as a string; older tokens carry
/// it in `user_id` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<i64>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    fn subject(&self) -> Option<i64> {
        self.sub
            .as_deref()
            .and_then(|s| s.parse().ok())
            .or(self.user_id)
    }
}

/// Turns bearer tokens into [`TenantContext`]s.
#[derive(Clone)]
pub struct TenantResolver {
    db: Database,
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: Duration,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for TenantResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantResolver")
            .field("db", &self.db)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

impl TenantResolver {
    #[must_use]
    pub fn new(db: Database, secret: &str, token_ttl: Duration) -> Self {
        Self {
            db,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            token_ttl,
            request_timeout: None,
        }
    }

    /// Contexts resolved from now on carry `now + timeout` as deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sign an HS256 token for `user`.
    pub fn issue_token(&self, user: &UserPrincipal) -> CoreResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Some(user.id.to_string()),
            user_id: None,
            clinic_id: user.clinic_id,
            iat: now,
            exp: now + self.token_ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Internal(format!("token encode: {e}")))
    }

    /// Verify signature and expiry.
    pub fn decode(&self, token: &str) -> CoreResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);

        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "rejected bearer token");
                CoreError::Unauthenticated
            })
    }

    /// Resolve the `Authorization` value (with or without `Bearer `).
    pub async fn resolve(&self, principal: Option<&str>) -> CoreResult<TenantContext> {
        let raw = principal.map(str::trim).filter(|s| !s.is_empty()).ok_or(CoreError::Unauthenticated)?;
        let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")).unwrap_or(raw).trim();

        let claims = self.decode(token)?;
        let user_id = claims.subject().ok_or(CoreError::Unauthenticated)?;
        let ctx = self.context_for(user_id).await?;

        // A transfer invalidates tokens minted for the previous clinic
        if let Some(claimed) = claims.clinic_id {
            if claimed != ctx.clinic_id {
                warn!(user_id, claimed, actual = ctx.clinic_id, "token clinic does not match user");
                return Err(CoreError::Unauthenticated);
            }
        }
        Ok(ctx)
    }

    /// Build a context for a known user id, applying the same tenant and
    /// activity checks as [`resolve`](Self::resolve).
    pub async fn context_for(&self, user_id: i64) -> CoreResult<TenantContext> {
        let user = self.load_principal(user_id).await?.ok_or(CoreError::Unauthenticated)?;
        let clinic_id = user.clinic_id.ok_or(CoreError::NoTenant)?;
        if !user.is_active {
            return Err(CoreError::Inactive);
        }

        let status = self
            .db
            .fetch_optional("SELECT status FROM clinics WHERE id = $1", &[clinic_id.into()])
            .await?
            .map(|row| db::text(&row, "status"))
            .transpose()?;
        if status.as_deref().and_then(ClinicStatus::parse) != Some(ClinicStatus::Active) {
            return Err(CoreError::Inactive);
        }

        Ok(TenantContext {
            user,
            clinic_id,
            deadline: self.request_timeout.map(|t| Instant::now() + t),
        })
    }

    async fn load_principal(&self, user_id: i64) -> CoreResult<Option<UserPrincipal>> {
        let sql = format!("SELECT {PRINCIPAL_COLUMNS} FROM users WHERE id = $1");
        let row = self.db.fetch_optional(&sql, &[user_id.into()]).await?;
        Ok(row.as_ref().map(UserPrincipal::from_row).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("tenant.db").display());
        let db = Database::connect("local", &url).await.unwrap();
        (dir, db)
    }

    async fn seed(db: &Database, clinic_status: &str, user_active: bool, with_clinic: bool) -> i64 {
        db.execute(
            "INSERT INTO clinics (id, name, status, created_at, updated_at) VALUES (1, 'Smile', $1, 0, 0)",
            &[clinic_status.into()],
        )
        .await
        .unwrap();
        let clinic = if with_clinic { Some(1_i64) } else { None };
        db.execute(
            "INSERT INTO users (id, clinic_id, email, name, role, is_active, created_at, updated_at)
             VALUES (10, $1, 'dr@smile.test', 'Dr', 'doctor', $2, 0, 0)",
            &[clinic.into(), user_active.into()],
        )
        .await
        .unwrap();
        10
    }

    fn resolver(db: &Database) -> TenantResolver {
        TenantResolver::new(db.clone(), "secret", Duration::from_secs(60))
    }

    fn principal(id: i64, clinic_id: Option<i64>) -> UserPrincipal {
        UserPrincipal {
            id,
            clinic_id,
            email: String::new(),
            name: String::new(),
            role: Role::Doctor,
            permissions: PermissionMap::new(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_missing_or_garbage_token_is_unauthenticated() {
        let (_dir, db) = setup().await;
        let r = resolver(&db);
        assert!(matches!(r.resolve(None).await, Err(CoreError::Unauthenticated)));
        assert!(matches!(r.resolve(Some("Bearer nope")).await, Err(CoreError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_valid_token_resolves_clinic() {
        let (_dir, db) = setup().await;
        let user_id = seed(&db, "active", true, true).await;
        let r = resolver(&db).with_request_timeout(Duration::from_secs(5));

        let token = r.issue_token(&principal(user_id, Some(1))).unwrap();
        let ctx = r.resolve(Some(&format!("Bearer {token}"))).await.unwrap();

        assert_eq!(ctx.clinic_id(), 1);
        assert_eq!(ctx.user().role, Role::Doctor);
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_user_without_clinic_has_no_tenant() {
        let (_dir, db) = setup().await;
        let user_id = seed(&db, "active", true, false).await;
        let r = resolver(&db);
        let token = r.issue_token(&principal(user_id, None)).unwrap();
        assert!(matches!(r.resolve(Some(&token)).await, Err(CoreError::NoTenant)));
    }

    #[tokio::test]
    async fn test_inactive_user_or_clinic_is_rejected() {
        let (_dir, db) = setup().await;
        let user_id = seed(&db, "suspended", true, true).await;
        let r = resolver(&db);
        let token = r.issue_token(&principal(user_id, Some(1))).unwrap();
        assert!(matches!(r.resolve(Some(&token)).await, Err(CoreError::Inactive)));

        let (_dir2, db2) = setup().await;
        let user_id = seed(&db2, "active", false, true).await;
        let r = resolver(&db2);
        let token = r.issue_token(&principal(user_id, Some(1))).unwrap();
        assert!(matches!(r.resolve(Some(&token)).await, Err(CoreError::Inactive)));
    }

    #[tokio::test]
    async fn test_token_for_other_clinic_is_rejected() {
        let (_dir, db) = setup().await;
        let user_id = seed(&db, "active", true, true).await;
        let r = resolver(&db);
        let token = r.issue_token(&principal(user_id, Some(2))).unwrap();
        assert!(matches!(r.resolve(Some(&token)).await, Err(CoreError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_legacy_user_id_claim() {
        let (_dir, db) = setup().await;
        let user_id = seed(&db, "active", true, true).await;
        let r = resolver(&db);
        let now = Utc::now().timestamp();
        let claims = Claims { sub: None, user_id: Some(user_id), clinic_id: None, iat: now, exp: now + 60 };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap();
        assert_eq!(r.resolve(Some(&token)).await.unwrap().user_id(), user_id);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let db_less = Claims { sub: Some("1".into()), user_id: None, clinic_id: None, iat: 0, exp: 1 };
        let token = jsonwebtoken::encode(&Header::default(), &db_less, &EncodingKey::from_secret(b"k")).unwrap();
        let decoding = DecodingKey::from_secret(b"k");
        let validation = Validation::new(Algorithm::HS256);
        assert!(jsonwebtoken::decode::<Claims>(&token, &decoding, &validation).is_err());
    }
}
