// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use sqlx::any::AnyRow;
use tracing::info;

use super::{apply_patch, ensure_owned, fetch_all, fetch_one, insert_row, marker, require_non_empty, track, Patch};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, now_millis, Database, StorageError};
use crate::error::CoreResult;
use crate::models::{EnrollDevice, UserDevice};
use crate::tenant::TenantContext;

const ENTITY: &str = "user_devices";

const COLUMNS: &str = "id, clinic_id, user_id, device_name, device_type, device_platform, device_serial, is_active, \
                       enrolled_at, last_seen, created_at, updated_at, synced_at, sync_status";

fn from_row(row: &AnyRow) -> Result<UserDevice, StorageError> {
    Ok(UserDevice {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        user_id: db::int(row, "user_id")?,
        device_name: db::text(row, "device_name")?,
        device_type: db::text(row, "device_type")?,
        device_platform: db::opt_text(row, "device_platform")?,
        device_serial: db::opt_text(row, "device_serial")?,
        is_active: db::flag(row, "is_active")?,
        enrolled_at: db::int(row, "enrolled_at")?,
        last_seen: db::opt_int(row, "last_seen")?,
        marker: marker(row)?,
    })
}

#[derive(Debug, Clone)]
pub struct DeviceRepository {
    db: Database,
}

impl DeviceRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enroll a workstation for a user of this clinic (the caller by default).
    pub async fn enroll(&self, ctx: &TenantContext, input: EnrollDevice) -> CoreResult<UserDevice> {
        require_non_empty("device_name", &input.device_name)?;
        let user_id = input.user_id.unwrap_or_else(|| ctx.user_id());
        ensure_owned(&self.db, ScopedQuery::new(ctx, "users").eq("id", user_id), "user", user_id).await?;

        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("user_id", user_id.into()),
            ("device_name", input.device_name.trim().into()),
            ("device_type", input.device_type.unwrap_or_else(|| "desktop".into()).into()),
            ("device_platform", input.device_platform.into()),
            ("device_serial", input.device_serial.into()),
            ("is_active", true.into()),
            ("enrolled_at", now_millis().into()),
        ];
        let device = track(ENTITY, "enroll", insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await)?;
        info!(device_id = device.id, user_id, "device enrolled");
        Ok(device)
    }

    pub async fn list(&self, ctx: &TenantContext, user_id: Option<i64>) -> CoreResult<Vec<UserDevice>> {
        let q = ScopedQuery::new(ctx, ENTITY).eq_opt("user_id", user_id).order_by("enrolled_at DESC, id DESC");
        track(ENTITY, "list", fetch_all(&self.db, q, COLUMNS, from_row).await)
    }

    pub async fn get_by_id(&self, ctx: &TenantContext, id: i64) -> CoreResult<UserDevice> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        track(ENTITY, "get", fetch_one(&self.db, q, COLUMNS, from_row, "device", id).await)
    }

    /// Heartbeat from an active device.
    pub async fn touch(&self, ctx: &TenantContext, id: i64) -> CoreResult<UserDevice> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id).eq("is_active", true);
        let changes = Patch::new().set_value("last_seen", now_millis());
        track(ENTITY, "touch", apply_patch(&self.db, q, changes, COLUMNS, from_row, "device", id).await)
    }

    pub async fn deactivate(&self, ctx: &TenantContext, id: i64) -> CoreResult<UserDevice> {
        let q = ScopedQuery::new(ctx, ENTITY).eq("id", id);
        let changes = Patch::new().set_value("is_active", false);
        track(ENTITY, "deactivate", apply_patch(&self.db, q, changes, COLUMNS, from_row, "device", id).await)
    }
}
