// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staff accounts and credentials.
//!
//! Passwords are stored as Argon2id PHC strings. Hashing and verification
//! run on the blocking pool.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use sqlx::any::AnyRow;
use tracing::{debug, info, instrument, warn};

use super::{apply_patch, count, fetch_all, fetch_one, fetch_page, group_counts, insert_row, marker, require_non_empty, track, Patch};
use crate::cache::{keys, Cache};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, now_millis, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::{ClinicStatus, CreateUser, PaginatedResult, Pagination, User, UserStats, UpdateUser};
use crate::permissions::{PermissionMap, Role};
use crate::tenant::{TenantContext, UserPrincipal, PRINCIPAL_COLUMNS};

const ENTITY: &str = "users";

const COLUMNS: &str = "id, clinic_id, email, name, role, permissions, is_active, created_by, \
                       created_at, updated_at, synced_at, sync_status";

const MIN_PASSWORD_LEN: usize = 8;

fn from_row(row: &AnyRow) -> Result<User, StorageError> {
    let principal = UserPrincipal::from_row(row)?;
    Ok(User {
        id: principal.id,
        clinic_id: principal.clinic_id,
        email: principal.email,
        name: principal.name,
        role: principal.role,
        permissions: principal.permissions,
        is_active: principal.is_active,
        created_by: db::opt_int(row, "created_by")?,
        marker: marker(row)?,
    })
}

fn permissions_json(permissions: &PermissionMap) -> String {
    permissions.to_json().to_string()
}

fn normalize_email(email: &str) -> CoreResult<String> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(CoreError::Validation(format!("'{email}' is not an email address")));
    }
    Ok(email)
}

/// Argon2id hash in PHC format.
async fn hash_password(password: String) -> CoreResult<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CoreError::Validation(format!("password must be at least {MIN_PASSWORD_LEN} characters")));
    }
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| CoreError::Internal(format!("password hash: {e}")))
    })
    .await
    .map_err(|e| CoreError::Internal(format!("hash task: {e}")))?
}

async fn verify_password(password: String, hash: String) -> CoreResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash).map_err(|e| CoreError::Internal(format!("stored hash: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(CoreError::Internal(format!("password verify: {e}"))),
        }
    })
    .await
    .map_err(|e| CoreError::Internal(format!("verify task: {e}")))?
}

/// Attach an unaffiliated user to `clinic_id`, optionally changing role.
/// Returns false when the user already belongs to a clinic (or is gone).
pub(crate) async fn attach_to_clinic(db: &Database, user_id: i64, clinic_id: i64, role: Option<Role>) -> CoreResult<bool> {
    let sql = "UPDATE users SET clinic_id = $1, role = COALESCE($2, role), \
               updated_at = CASE WHEN updated_at >= $3 THEN updated_at + 1 ELSE $3 END, sync_status = 'local' \
               WHERE id = $4 AND clinic_id IS NULL";
    let params: [SqlParam; 4] = [
        clinic_id.into(),
        role.map(Role::as_str).into(),
        now_millis().into(),
        user_id.into(),
    ];
    Ok(db.execute(sql, &params).await? == 1)
}

#[derive(Debug, Clone)]
pub struct UserRepository {
    db: Database,
    cache: Cache,
}

impl UserRepository {
    #[must_use]
    pub fn new(db: Database, cache: Cache) -> Self {
        Self { db, cache }
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<User> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "user", id).await)
    }

    /// Platform-level lookup, used by login and onboarding.
    pub async fn get_by_email(&self, email: &str) -> CoreResult<Option<User>> {
        let email = email.trim().to_lowercase();
        let row = self
            .db
            .fetch_optional(&format!("SELECT {COLUMNS} FROM users WHERE email = $1"), &[email.into()])
            .await?;
        Ok(row.as_ref().map(from_row).transpose()?)
    }

    pub async fn list(&self, ctx: &TenantContext, page: &Pagination) -> CoreResult<PaginatedResult<User>> {
        let q = ScopedQuery::new(ctx, ENTITY);
        track(ENTITY, "list", fetch_page(&self.db, q, COLUMNS, "name ASC, id ASC", page, from_row).await)
    }

    /// Active staff with `role`.
    pub async fn list_by_role(&self, ctx: &TenantContext, role: Role) -> CoreResult<Vec<User>> {
        let q = ScopedQuery::new(ctx, ENTITY)
            .eq("role", role.as_str())
            .eq("is_active", true)
            .order_by("name ASC, id ASC");
        track(ENTITY, "list_by_role", fetch_all(&self.db, q, COLUMNS, from_row).await)
    }

    /// Add a staff member to the caller's clinic. Ownership is only ever
    /// granted by onboarding.
    #[instrument(skip(self, ctx, input), fields(clinic_id = ctx.clinic_id()))]
    pub async fn create(&self, ctx: &TenantContext, input: CreateUser) -> CoreResult<User> {
        require_non_empty("name", &input.name)?;
        let email = normalize_email(&input.email)?;
        if input.role == Role::ClinicOwner {
            return Err(CoreError::Validation("staff cannot be created as clinic_owner".into()));
        }
        let password_hash = match input.password {
            Some(p) => Some(hash_password(p).await?),
            None => None,
        };

        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("email", email.into()),
            ("name", input.name.trim().into()),
            ("role", input.role.as_str().into()),
            ("permissions", permissions_json(&input.permissions).into()),
            ("is_active", true.into()),
            ("password_hash", password_hash.into()),
            ("created_by", ctx.user_id().into()),
        ];
        let user = track(ENTITY, "create", insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await)?;
        info!(user_id = user.id, role = %user.role, "staff member added");
        Ok(user)
    }

    /// Self-service signup. The account has no clinic until onboarding or
    /// [`assign_clinic`](Self::assign_clinic).
    pub async fn register(&self, email: &str, name: &str, password: String) -> CoreResult<User> {
        require_non_empty("name", name)?;
        let email = normalize_email(email)?;
        let hash = hash_password(password).await?;
        let values: Vec<(&'static str, SqlParam)> = vec![
            ("email", email.into()),
            ("name", name.trim().into()),
            ("role", Role::Receptionist.as_str().into()),
            ("permissions", permissions_json(&PermissionMap::new()).into()),
            ("is_active", true.into()),
            ("password_hash", hash.into()),
        ];
        track(ENTITY, "register", insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await)
    }

    /// Check credentials. Unknown email and wrong password are
    /// indistinguishable to the caller.
    pub async fn authenticate(&self, email: &str, password: &str) -> CoreResult<UserPrincipal> {
        let email = email.trim().to_lowercase();
        let row = self
            .db
            .fetch_optional(
                &format!("SELECT {PRINCIPAL_COLUMNS}, password_hash FROM users WHERE email = $1"),
                &[email.into()],
            )
            .await?;
        let Some(row) = row else {
            debug!("login for unknown email");
            return track(ENTITY, "authenticate", Err(CoreError::Unauthenticated));
        };
        let Some(hash) = db::opt_text(&row, "password_hash")? else {
            return track(ENTITY, "authenticate", Err(CoreError::Unauthenticated));
        };
        if !verify_password(password.to_string(), hash).await? {
            return track(ENTITY, "authenticate", Err(CoreError::Unauthenticated));
        }
        let principal = UserPrincipal::from_row(&row)?;
        if !principal.is_active {
            return track(ENTITY, "authenticate", Err(CoreError::Inactive));
        }
        track(ENTITY, "authenticate", Ok(principal))
    }

    pub async fn update(&self, ctx: &TenantContext, id: i64, patch: UpdateUser) -> CoreResult<User> {
        if let Some(name) = patch.name.as_deref() {
            require_non_empty("name", name)?;
        }
        if patch.role == Some(Role::ClinicOwner) {
            return Err(CoreError::Validation("ownership cannot be granted by update".into()));
        }
        let changes = Patch::new().set("name", patch.name).set("role", patch.role.map(Role::as_str));
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let user = track(ENTITY, "update", apply_patch(&self.db, q, changes, COLUMNS, from_row, "user", id).await)?;
        self.cache.invalidate_user(id).await;
        Ok(user)
    }

    /// Replace the stored permission map with its canonical form.
    pub async fn update_permissions(&self, ctx: &TenantContext, id: i64, permissions: PermissionMap) -> CoreResult<User> {
        let changes = Patch::new().set_value("permissions", permissions_json(&permissions));
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let result = apply_patch(&self.db, q, changes, COLUMNS, from_row, "user", id).await;
        let user = track(ENTITY, "update_permissions", result)?;
        self.cache.invalidate_user(id).await;
        info!(user_id = id, "permissions updated");
        Ok(user)
    }

    /// Soft delete. Callers cannot deactivate themselves.
    pub async fn deactivate(&self, ctx: &TenantContext, id: i64) -> CoreResult<User> {
        if id == ctx.user_id() {
            return Err(CoreError::Validation("cannot deactivate your own account".into()));
        }
        let changes = Patch::new().set_value("is_active", false);
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let user = track(ENTITY, "deactivate", apply_patch(&self.db, q, changes, COLUMNS, from_row, "user", id).await)?;
        self.cache.invalidate_user(id).await;
        Ok(user)
    }

    /// Attach a clinic-less user to `clinic_id`. Succeeds once per user.
    pub async fn assign_clinic(&self, user_id: i64, clinic_id: i64) -> CoreResult<()> {
        let result = if attach_to_clinic(&self.db, user_id, clinic_id, None).await? {
            Ok(())
        } else {
            let exists = self.db.fetch_optional("SELECT id FROM users WHERE id = $1", &[user_id.into()]).await?;
            match exists {
                Some(_) => Err(CoreError::Conflict { field: "clinic_id".into() }),
                None => Err(CoreError::not_found("user", user_id)),
            }
        };
        track(ENTITY, "assign_clinic", result)?;
        self.cache.invalidate_user(user_id).await;
        Ok(())
    }

    /// Move a staff member of the caller's clinic to another active clinic.
    /// Tokens minted for the old clinic stop resolving.
    #[instrument(skip(self, ctx), fields(clinic_id = ctx.clinic_id()))]
    pub async fn transfer_to_clinic(&self, ctx: &TenantContext, user_id: i64, target_clinic_id: i64) -> CoreResult<User> {
        if user_id == ctx.user_id() {
            return Err(CoreError::Validation("cannot transfer your own account".into()));
        }
        if target_clinic_id == ctx.clinic_id() {
            return self.get_by_id(ctx, user_id).await;
        }
        let target = self
            .db
            .fetch_optional("SELECT status FROM clinics WHERE id = $1", &[target_clinic_id.into()])
            .await?
            .map(|row| db::text(&row, "status"))
            .transpose()?;
        if target.as_deref().and_then(ClinicStatus::parse) != Some(ClinicStatus::Active) {
            return Err(CoreError::InvalidReference(format!("clinic {target_clinic_id}")));
        }

        let q = ScopedQuery::new(ctx, ENTITY).eq("id", user_id);
        let changes = Patch::new().set_value("clinic_id", target_clinic_id);
        let result = apply_patch(&self.db, q, changes, COLUMNS, from_row, "user", user_id).await;
        let user = track(ENTITY, "transfer", result)?;
        self.cache.invalidate_user(user_id).await;
        warn!(user_id, from = ctx.clinic_id(), to = target_clinic_id, "user transferred");
        Ok(user)
    }

    pub async fn stats(&self, ctx: &TenantContext) -> CoreResult<UserStats> {
        let q = ScopedQuery::new(ctx, ENTITY);
        Ok(UserStats {
            total: count(&self.db, &q).await?,
            active: count(&self.db, &ScopedQuery::new(ctx, ENTITY).eq("is_active", true)).await?,
            by_role: group_counts(&self.db, &q, "role").await?,
        })
    }

    /// Cached profile lookup for the caller's clinic.
    pub async fn profile(&self, ctx: &TenantContext, id: i64) -> CoreResult<User> {
        let key = keys::user(id);
        if let Some(hit) = self.cache.get_json::<User>(&key).await {
            if hit.clinic_id == Some(ctx.clinic_id()) {
                return Ok(hit);
            }
        }
        let user = self.get_by_id(ctx, id).await?;
        self.cache.set_json(&key, &user, self.cache.ttl()).await;
        Ok(user)
    }
}
