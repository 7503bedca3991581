// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table definitions for both dialects.
//!
//! Every tracked table carries the sync marker
//! `(updated_at, synced_at, sync_status)`. Tenant-owned tables carry a
//! non-null `clinic_id`. Display-id tables carry a unique `display_id`.
//!
//! `{PK}` and `{REAL}` are expanded per dialect; everything else is
//! portable DDL.

use super::{Database, Dialect, StorageError};

/// Every table this crate creates.
pub const TABLE_NAMES: [&str; 13] = [
    "clinics",
    "users",
    "treatment_types",
    "referring_doctors",
    "scan_types",
    "patients",
    "appointments",
    "reports",
    "payments",
    "user_devices",
    "attendance",
    "id_sequences",
    "sync_checkpoints",
];

const SYNC_MARKER: &str = "
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    synced_at BIGINT,
    sync_status TEXT NOT NULL DEFAULT 'local'";

const TABLES: &[(&str, &str)] = &[
    ("clinics", "
        id {PK},
        name TEXT NOT NULL,
        address TEXT,
        phone TEXT,
        email TEXT,
        gst_number TEXT,
        specialization TEXT NOT NULL DEFAULT 'dental',
        subscription_plan TEXT NOT NULL DEFAULT 'free',
        status TEXT NOT NULL DEFAULT 'active',"),
    ("users", "
        id {PK},
        clinic_id BIGINT REFERENCES clinics(id),
        email TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'receptionist',
        permissions TEXT NOT NULL DEFAULT '{}',
        is_active BIGINT NOT NULL DEFAULT 1,
        password_hash TEXT,
        created_by BIGINT,"),
    ("treatment_types", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        name TEXT NOT NULL,
        price {REAL} NOT NULL DEFAULT 0,
        is_active BIGINT NOT NULL DEFAULT 1,"),
    ("referring_doctors", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        name TEXT NOT NULL,
        hospital TEXT,
        phone TEXT,
        is_active BIGINT NOT NULL DEFAULT 1,"),
    ("scan_types", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        name TEXT NOT NULL,
        price {REAL} NOT NULL DEFAULT 0,
        is_active BIGINT NOT NULL DEFAULT 1,"),
    ("patients", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        display_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        age BIGINT NOT NULL DEFAULT 0,
        gender TEXT NOT NULL DEFAULT '',
        village TEXT NOT NULL DEFAULT '',
        phone TEXT NOT NULL DEFAULT '',
        referred_by TEXT NOT NULL DEFAULT '',
        treatment_type TEXT NOT NULL DEFAULT '',
        notes TEXT,
        payment_type TEXT NOT NULL DEFAULT 'Cash',"),
    ("appointments", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        patient_id BIGINT REFERENCES patients(id),
        patient_name TEXT NOT NULL,
        patient_email TEXT,
        patient_phone TEXT,
        doctor_id BIGINT REFERENCES users(id),
        treatment TEXT NOT NULL DEFAULT '',
        appointment_date TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        duration BIGINT NOT NULL DEFAULT 60,
        status TEXT NOT NULL DEFAULT 'confirmed',
        notes TEXT,
        created_by BIGINT,"),
    ("reports", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        patient_id BIGINT NOT NULL REFERENCES patients(id),
        display_id TEXT NOT NULL UNIQUE,
        content TEXT,
        docx_url TEXT,
        pdf_url TEXT,
        status TEXT NOT NULL DEFAULT 'draft',
        send_count BIGINT NOT NULL DEFAULT 0,
        finalized_at BIGINT,"),
    ("payments", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        patient_id BIGINT NOT NULL REFERENCES patients(id),
        report_id BIGINT REFERENCES reports(id),
        treatment_type_id BIGINT REFERENCES treatment_types(id),
        display_id TEXT NOT NULL UNIQUE,
        amount {REAL} NOT NULL,
        payment_method TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        transaction_id TEXT,
        notes TEXT,
        paid_by TEXT,
        received_by BIGINT REFERENCES users(id),"),
    ("user_devices", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        user_id BIGINT NOT NULL REFERENCES users(id),
        device_name TEXT NOT NULL,
        device_type TEXT NOT NULL DEFAULT 'desktop',
        device_platform TEXT,
        device_serial TEXT,
        is_active BIGINT NOT NULL DEFAULT 1,
        enrolled_at BIGINT NOT NULL,
        last_seen BIGINT,"),
    ("attendance", "
        id {PK},
        clinic_id BIGINT NOT NULL REFERENCES clinics(id),
        user_id BIGINT NOT NULL REFERENCES users(id),
        date TEXT NOT NULL,
        check_in BIGINT NOT NULL,
        check_out BIGINT,
        status TEXT NOT NULL DEFAULT 'present',
        notes TEXT,"),
];

const BOOKKEEPING: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS id_sequences (
        prefix TEXT NOT NULL,
        year BIGINT NOT NULL,
        last_value BIGINT NOT NULL,
        PRIMARY KEY (prefix, year)
    )",
    "CREATE TABLE IF NOT EXISTS sync_checkpoints (
        clinic_id BIGINT NOT NULL,
        table_name TEXT NOT NULL,
        cursor_updated_at BIGINT NOT NULL,
        cursor_id BIGINT NOT NULL,
        last_synced_at BIGINT NOT NULL,
        PRIMARY KEY (clinic_id, table_name)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_attendance_user_date ON attendance (user_id, date)",
];

/// DDL statements for `dialect`, in dependency order.
#[must_use]
pub fn statements(dialect: Dialect) -> Vec<String> {
    let (pk, real) = match dialect {
        Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "REAL"),
        Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "DOUBLE PRECISION"),
    };

    let mut out = Vec::with_capacity(TABLES.len() * 3 + BOOKKEEPING.len());
    for (name, body) in TABLES {
        let body = body.replace("{PK}", pk).replace("{REAL}", real);
        out.push(format!("CREATE TABLE IF NOT EXISTS {name} ({body}{SYNC_MARKER}\n)"));

        let scope = if *name == "clinics" { "" } else { "clinic_id, " };
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{name}_changes ON {name} ({scope}updated_at, id)"
        ));
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{name}_sync_status ON {name} ({scope}sync_status)"
        ));
    }
    out.extend(BOOKKEEPING.iter().map(|s| (*s).to_string()));
    out
}

/// Create missing tables and indexes. Idempotent.
pub async fn apply(db: &Database) -> Result<(), StorageError> {
    for stmt in statements(db.dialect()) {
        sqlx::query(&stmt).execute(db.pool()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_tracked_table_has_sync_marker() {
        for stmt in statements(Dialect::Sqlite).iter().filter(|s| s.starts_with("CREATE TABLE")) {
            if stmt.contains("id_sequences") || stmt.contains("sync_checkpoints") {
                continue;
            }
            assert!(stmt.contains("updated_at BIGINT NOT NULL"), "{stmt}");
            assert!(stmt.contains("sync_status TEXT NOT NULL DEFAULT 'local'"), "{stmt}");
        }
    }

    #[test]
    fn test_dialect_specific_types() {
        let sqlite = statements(Dialect::Sqlite).join("\n");
        let pg = statements(Dialect::Postgres).join("\n");

        assert!(sqlite.contains("INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!sqlite.contains("BIGSERIAL"));
        assert!(pg.contains("BIGSERIAL PRIMARY KEY"));
        assert!(pg.contains("amount DOUBLE PRECISION NOT NULL"));
        assert!(!pg.contains("{PK}") && !pg.contains("{REAL}"));
    }

    #[test]
    fn test_display_id_tables_are_unique() {
        let ddl = statements(Dialect::Postgres);
        for table in ["patients", "reports", "payments"] {
            let stmt = ddl.iter().find(|s| s.contains(&format!("TABLE IF NOT EXISTS {table} "))).unwrap();
            assert!(stmt.contains("display_id TEXT NOT NULL UNIQUE"));
        }
    }
}
