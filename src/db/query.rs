// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tenant-scoped SQL builder.
//!
//! [`ScopedQuery`] can only be created from a [`TenantContext`], and the
//! first predicate it emits is always the clinic predicate bound to `$1`.
//! Repositories build every read, update and delete through it, so a
//! statement without a clinic filter is not expressible.
//!
//! Column and table names are `&'static str`; only values travel as
//! parameters.
//!
//! ```text
//! ScopedQuery::new(&ctx, "patients").eq("id", 42).like_any(&["name", "phone"], "ram")
//!   → WHERE clinic_id = $1 AND id = $2 AND (LOWER(name) LIKE $3 OR LOWER(phone) LIKE $3)
//! ```

use crate::models::Pagination;
use crate::tenant::TenantContext;

/// Storage class of a column, used to type NULL binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Real,
    Text,
    Blob,
}

/// SQL parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Null(ColumnKind),
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self { SqlParam::Int(v) }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self { SqlParam::Real(v) }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self { SqlParam::Int(i64::from(v)) }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self { SqlParam::Text(v) }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self { SqlParam::Text(v.to_string()) }
}

impl From<Option<i64>> for SqlParam {
    fn from(v: Option<i64>) -> Self { v.map_or(SqlParam::Null(ColumnKind::Int), SqlParam::Int) }
}

impl From<Option<f64>> for SqlParam {
    fn from(v: Option<f64>) -> Self { v.map_or(SqlParam::Null(ColumnKind::Real), SqlParam::Real) }
}

impl From<Option<String>> for SqlParam {
    fn from(v: Option<String>) -> Self { v.map_or(SqlParam::Null(ColumnKind::Text), SqlParam::Text) }
}

impl From<Option<&str>> for SqlParam {
    fn from(v: Option<&str>) -> Self { v.map(str::to_string).into() }
}

#[derive(Debug, Clone)]
pub struct ScopedQuery {
    table: &'static str,
    conditions: Vec<String>,
    params: Vec<SqlParam>,
    order: Option<&'static str>,
    limit: Option<(i64, i64)>,
}

impl ScopedQuery {
    /// Rows of a clinic-owned table.
    #[must_use]
    pub fn new(ctx: &TenantContext, table: &'static str) -> Self {
        Self::scoped_by(ctx, table, "clinic_id")
    }

    /// The tenant's own row in `clinics`.
    #[must_use]
    pub fn clinic(ctx: &TenantContext) -> Self {
        Self::scoped_by(ctx, "clinics", "id")
    }

    fn scoped_by(ctx: &TenantContext, table: &'static str, tenant_column: &'static str) -> Self {
        Self {
            table,
            conditions: vec![format!("{tenant_column} = $1")],
            params: vec![SqlParam::Int(ctx.clinic_id())],
            order: None,
            limit: None,
        }
    }

    fn placeholder(&mut self, value: SqlParam) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    #[must_use]
    pub fn eq(mut self, column: &'static str, value: impl Into<SqlParam>) -> Self {
        let p = self.placeholder(value.into());
        self.conditions.push(format!("{column} = {p}"));
        self
    }

    #[must_use]
    pub fn eq_opt<V: Into<SqlParam>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.eq(column, v),
            None => self,
        }
    }

    #[must_use]
    pub fn is_null(mut self, column: &'static str) -> Self {
        self.conditions.push(format!("{column} IS NULL"));
        self
    }

    /// `column >= value` / `column <= value` style comparisons.
    #[must_use]
    pub fn cmp(mut self, column: &'static str, op: Cmp, value: impl Into<SqlParam>) -> Self {
        let p = self.placeholder(value.into());
        self.conditions.push(format!("{column} {} {p}", op.as_sql()));
        self
    }

    /// Case-insensitive substring match on any of `columns`.
    #[must_use]
    pub fn like_any(mut self, columns: &[&'static str], needle: &str) -> Self {
        let needle = needle.trim();
        if needle.is_empty() || columns.is_empty() {
            return self;
        }
        let p = self.placeholder(SqlParam::Text(format!("%{}%", escape_like(&needle.to_lowercase()))));
        let parts: Vec<String> = columns
            .iter()
            .map(|c| format!("LOWER({c}) LIKE {p} ESCAPE '\\'"))
            .collect();
        self.conditions.push(format!("({})", parts.join(" OR ")));
        self
    }

    #[must_use]
    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order = Some(clause);
        self
    }

    #[must_use]
    pub fn page(mut self, page: &Pagination) -> Self {
        self.limit = Some((page.limit(), page.offset()));
        self
    }

    fn where_clause(&self) -> String {
        self.conditions.join(" AND ")
    }

    #[must_use]
    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    #[must_use]
    pub fn select_sql(&self, columns: &str) -> String {
        let mut sql = format!("SELECT {columns} FROM {} WHERE {}", self.table, self.where_clause());
        if let Some(order) = self.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some((limit, offset)) = self.limit {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }
        sql
    }

    #[must_use]
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) AS n FROM {} WHERE {}", self.table, self.where_clause())
    }

    /// `SELECT agg AS alias` over the scoped rows, e.g. `SUM(amount)`.
    #[must_use]
    pub fn aggregate_sql(&self, expr: &str, alias: &str) -> String {
        format!("SELECT {expr} AS {alias} FROM {} WHERE {}", self.table, self.where_clause())
    }

    #[must_use]
    pub fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE {}", self.table, self.where_clause())
    }

    /// `SELECT column AS k, COUNT(*) AS n ... GROUP BY column`.
    #[must_use]
    pub fn group_count_sql(&self, column: &str) -> String {
        format!(
            "SELECT {column} AS k, COUNT(*) AS n FROM {} WHERE {} GROUP BY {column}",
            self.table,
            self.where_clause()
        )
    }

    /// Consume into an UPDATE. Assignment values are appended after the
    /// predicate parameters. Returns the SQL and the full parameter list.
    #[must_use]
    pub fn into_update(mut self, assignments: Vec<(&'static str, SqlParam)>, returning: Option<&str>) -> (String, Vec<SqlParam>) {
        let sets = self.assign(assignments);
        self.update_sql(sets, returning)
    }

    /// UPDATE that also advances the sync marker: `updated_at` becomes
    /// `max(now, updated_at + 1)` and the row is queued for push again.
    /// `expressions` are literal SET clauses such as `n = n + 1`.
    #[must_use]
    pub fn into_stamped_update(
        mut self,
        assignments: Vec<(&'static str, SqlParam)>,
        expressions: &[&'static str],
        now: i64,
        returning: Option<&str>,
    ) -> (String, Vec<SqlParam>) {
        let mut sets = self.assign(assignments);
        sets.extend(expressions.iter().map(|e| (*e).to_string()));
        let p = self.placeholder(SqlParam::Int(now));
        sets.push(format!("updated_at = CASE WHEN updated_at >= {p} THEN updated_at + 1 ELSE {p} END"));
        sets.push("sync_status = 'local'".to_string());
        self.update_sql(sets, returning)
    }

    fn assign(&mut self, assignments: Vec<(&'static str, SqlParam)>) -> Vec<String> {
        assignments
            .into_iter()
            .map(|(col, value)| {
                let p = self.placeholder(value);
                format!("{col} = {p}")
            })
            .collect()
    }

    fn update_sql(self, sets: Vec<String>, returning: Option<&str>) -> (String, Vec<SqlParam>) {
        let mut sql = format!("UPDATE {} SET {} WHERE {}", self.table, sets.join(", "), self.where_clause());
        if let Some(cols) = returning {
            sql.push_str(" RETURNING ");
            sql.push_str(cols);
        }
        (sql, self.params)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    fn as_sql(self) -> &'static str {
        match self {
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }
}

pub(crate) fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Build a parameterized INSERT for a tenant-owned row.
///
/// The caller passes `clinic_id` explicitly from the context; the builder
/// only numbers the placeholders.
#[must_use]
pub fn insert_sql(table: &'static str, columns: &[&'static str], returning: &str) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING {returning}",
        columns.join(", "),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantContext;

    #[test]
    fn test_every_statement_starts_with_clinic_predicate() {
        let ctx = TenantContext::for_tests(3);
        let q = ScopedQuery::new(&ctx, "patients").eq("id", 42);

        assert_eq!(
            q.select_sql("*"),
            "SELECT * FROM patients WHERE clinic_id = $1 AND id = $2"
        );
        assert_eq!(q.params(), &[SqlParam::Int(3), SqlParam::Int(42)]);
        assert_eq!(q.delete_sql(), "DELETE FROM patients WHERE clinic_id = $1 AND id = $2");
        assert_eq!(q.count_sql(), "SELECT COUNT(*) AS n FROM patients WHERE clinic_id = $1 AND id = $2");
    }

    #[test]
    fn test_clinic_scope_uses_id_column() {
        let ctx = TenantContext::for_tests(9);
        let q = ScopedQuery::clinic(&ctx);
        assert_eq!(q.select_sql("name"), "SELECT name FROM clinics WHERE id = $1");
    }

    #[test]
    fn test_like_any_shares_one_placeholder_and_escapes() {
        let ctx = TenantContext::for_tests(1);
        let q = ScopedQuery::new(&ctx, "patients").like_any(&["name", "phone"], " 50%_Off ");

        assert_eq!(
            q.select_sql("id"),
            "SELECT id FROM patients WHERE clinic_id = $1 AND (LOWER(name) LIKE $2 ESCAPE '\\' OR LOWER(phone) LIKE $2 ESCAPE '\\')"
        );
        assert_eq!(q.params()[1], SqlParam::Text("%50\\%\\_off%".into()));
    }

    #[test]
    fn test_blank_search_adds_nothing() {
        let ctx = TenantContext::for_tests(1);
        let q = ScopedQuery::new(&ctx, "patients").like_any(&["name"], "   ");
        assert_eq!(q.params().len(), 1);
    }

    #[test]
    fn test_update_numbers_assignments_after_predicates() {
        let ctx = TenantContext::for_tests(5);
        let (sql, params) = ScopedQuery::new(&ctx, "patients")
            .eq("id", 8)
            .into_update(vec![("name", "Asha".into()), ("updated_at", SqlParam::Int(100))], Some("id"));

        assert_eq!(
            sql,
            "UPDATE patients SET name = $3, updated_at = $4 WHERE clinic_id = $1 AND id = $2 RETURNING id"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_stamped_update_advances_marker() {
        let ctx = TenantContext::for_tests(2);
        let (sql, params) = ScopedQuery::new(&ctx, "reports")
            .eq("id", 4)
            .into_stamped_update(vec![("content", "x".into())], &["send_count = send_count + 1"], 1_000, None);

        assert_eq!(
            sql,
            "UPDATE reports SET content = $3, send_count = send_count + 1, updated_at = CASE WHEN updated_at >= $4 THEN updated_at + 1 ELSE $4 END, \
             sync_status = 'local' WHERE clinic_id = $1 AND id = $2"
        );
        assert_eq!(params[3], SqlParam::Int(1_000));
    }

    #[test]
    fn test_group_count_is_scoped() {
        let ctx = TenantContext::for_tests(2);
        let q = ScopedQuery::new(&ctx, "users");
        assert_eq!(
            q.group_count_sql("role"),
            "SELECT role AS k, COUNT(*) AS n FROM users WHERE clinic_id = $1 GROUP BY role"
        );
    }

    #[test]
    fn test_paging_and_order() {
        let ctx = TenantContext::for_tests(5);
        let q = ScopedQuery::new(&ctx, "reports")
            .order_by("created_at DESC, id DESC")
            .page(&Pagination::new(20, 10));
        assert!(q.select_sql("*").ends_with("ORDER BY created_at DESC, id DESC LIMIT 10 OFFSET 20"));
    }

    #[test]
    fn test_insert_sql_numbers_placeholders() {
        assert_eq!(
            insert_sql("scan_types", &["clinic_id", "name"], "id"),
            "INSERT INTO scan_types (clinic_id, name) VALUES ($1, $2) RETURNING id"
        );
    }
}
