// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daily staff check-in/check-out. One row per user per local date.

use chrono::Local;
use sqlx::any::AnyRow;

use super::{apply_patch, count, fetch_page, insert_row, marker, track, Patch};
use crate::db::query::{ScopedQuery, SqlParam};
use crate::db::{self, now_millis, Database, StorageError};
use crate::error::{CoreError, CoreResult};
use crate::models::{Attendance, AttendanceFilter, PaginatedResult, Pagination};
use crate::tenant::TenantContext;

const ENTITY: &str = "attendance";

const COLUMNS: &str = "id, clinic_id, user_id, date, check_in, check_out, status, notes, \
                       created_at, updated_at, synced_at, sync_status";

fn from_row(row: &AnyRow) -> Result<Attendance, StorageError> {
    Ok(Attendance {
        id: db::int(row, "id")?,
        clinic_id: db::int(row, "clinic_id")?,
        user_id: db::int(row, "user_id")?,
        date: db::text(row, "date")?,
        check_in: db::int(row, "check_in")?,
        check_out: db::opt_int(row, "check_out")?,
        status: db::text(row, "status")?,
        notes: db::opt_text(row, "notes")?,
        marker: marker(row)?,
    })
}

fn today() -> String {
    Local::now().date_naive().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone)]
pub struct AttendanceRepository {
    db: Database,
}

impl AttendanceRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// First check-in of the day for the caller.
    pub async fn check_in(&self, ctx: &TenantContext, notes: Option<String>) -> CoreResult<Attendance> {
        let values: Vec<(&'static str, SqlParam)> = vec![
            ("clinic_id", ctx.clinic_id().into()),
            ("user_id", ctx.user_id().into()),
            ("date", today().into()),
            ("check_in", now_millis().into()),
            ("status", "present".into()),
            ("notes", notes.into()),
        ];
        let result = match insert_row(&self.db, ENTITY, values, COLUMNS, from_row).await {
            // (user_id, date) is unique
            Err(CoreError::Conflict { .. }) => Err(CoreError::Conflict { field: "date".into() }),
            other => other,
        };
        track(ENTITY, "check_in", result)
    }

    /// Close today's open check-in.
    pub async fn check_out(&self, ctx: &TenantContext) -> CoreResult<Attendance> {
        let date = today();
        let todays = || ScopedQuery::new(ctx, ENTITY).eq("user_id", ctx.user_id()).eq("date", date.clone());
        let changes = Patch::new().set_value("check_out", now_millis());
        let mut result = apply_patch(&self.db, todays().is_null("check_out"), changes, COLUMNS, from_row, "attendance", ctx.user_id()).await;
        if matches!(result, Err(CoreError::NotFound { .. })) && count(&self.db, &todays()).await? > 0 {
            result = Err(CoreError::Conflict { field: "check_out".into() });
        }
        track(ENTITY, "check_out", result)
    }

    /// Newest day first.
    pub async fn list(&self, ctx: &TenantContext, filter: &AttendanceFilter, page: &Pagination) -> CoreResult<PaginatedResult<Attendance>> {
        let q = ScopedQuery::new(ctx, ENTITY).eq_opt("date", filter.date.clone()).eq_opt("user_id", filter.user_id);
        track(ENTITY, "list", fetch_page(&self.db, q, COLUMNS, "date DESC, check_in DESC, id DESC", page, from_row).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing::store;

    #[tokio::test]
    async fn test_one_check_in_per_day() {
        let (_dir, db) = store().await;
        let repo = AttendanceRepository::new(db);
        let ctx = TenantContext::for_tests(1);

        let row = repo.check_in(&ctx, None).await.unwrap();
        assert_eq!(row.date, today());
        assert!(row.check_out.is_none());

        let again = repo.check_in(&ctx, None).await;
        assert!(matches!(again, Err(CoreError::Conflict { ref field }) if field == "date"));
    }

    #[tokio::test]
    async fn test_check_out_once() {
        let (_dir, db) = store().await;
        let repo = AttendanceRepository::new(db);
        let ctx = TenantContext::for_tests(1);

        assert!(matches!(repo.check_out(&ctx).await, Err(CoreError::NotFound { .. })));

        repo.check_in(&ctx, None).await.unwrap();
        let closed = repo.check_out(&ctx).await.unwrap();
        assert!(closed.check_out.is_some());
        assert!(matches!(repo.check_out(&ctx).await, Err(CoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_list_filters_by_date() {
        let (_dir, db) = store().await;
        let repo = AttendanceRepository::new(db);
        let ctx = TenantContext::for_tests(1);
        repo.check_in(&ctx, Some("early".into())).await.unwrap();
        repo.check_in(&TenantContext::for_tests(2), None).await.unwrap();

        let filter = AttendanceFilter { date: Some(today()), user_id: None };
        let page = repo.list(&ctx, &filter, &Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].notes.as_deref(), Some("early"));
    }
}
