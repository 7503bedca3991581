// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replicated tables, in dependency order.

use serde::Serialize;
use std::fmt;

use crate::db::query::ColumnKind;

/// A table the sync engine replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Clinics,
    Users,
    TreatmentTypes,
    ReferringDoctors,
    ScanTypes,
    Patients,
    Appointments,
    Reports,
    Payments,
    UserDevices,
    Attendance,
}

/// Every replicated table; parents before children.
pub const SYNC_TABLES: [SyncTable; 11] = [
    SyncTable::Clinics,
    SyncTable::Users,
    SyncTable::TreatmentTypes,
    SyncTable::ReferringDoctors,
    SyncTable::ScanTypes,
    SyncTable::Patients,
    SyncTable::Appointments,
    SyncTable::Reports,
    SyncTable::Payments,
    SyncTable::UserDevices,
    SyncTable::Attendance,
];

use ColumnKind::{Int, Real, Text};

const MARKER: [(&str, ColumnKind); 4] =
    [("created_at", Int), ("updated_at", Int), ("synced_at", Int), ("sync_status", Text)];

macro_rules! columns {
    ($($name:literal : $kind:ident),+ $(,)?) => {
        &[$(($name, $kind)),+, MARKER[0], MARKER[1], MARKER[2], MARKER[3]]
    };
}

const CLINICS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "name": Text, "address": Text, "phone": Text, "email": Text, "gst_number": Text,
    "specialization": Text, "subscription_plan": Text, "status": Text,
);
const USERS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "email": Text, "name": Text, "role": Text, "permissions": Text,
    "is_active": Int, "password_hash": Text, "created_by": Int,
);
const PRICED: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "name": Text, "price": Real, "is_active": Int,
);
const REFERRING_DOCTORS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "name": Text, "hospital": Text, "phone": Text, "is_active": Int,
);
const PATIENTS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "display_id": Text, "name": Text, "age": Int, "gender": Text,
    "village": Text, "phone": Text, "referred_by": Text, "treatment_type": Text, "notes": Text,
    "payment_type": Text,
);
const APPOINTMENTS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "patient_id": Int, "patient_name": Text, "patient_email": Text,
    "patient_phone": Text, "doctor_id": Int, "treatment": Text, "appointment_date": Text,
    "start_time": Text, "end_time": Text, "duration": Int, "status": Text, "notes": Text,
    "created_by": Int,
);
const REPORTS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "patient_id": Int, "display_id": Text, "content": Text,
    "docx_url": Text, "pdf_url": Text, "status": Text, "send_count": Int, "finalized_at": Int,
);
const PAYMENTS: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "patient_id": Int, "report_id": Int, "treatment_type_id": Int,
    "display_id": Text, "amount": Real, "payment_method": Text, "status": Text,
    "transaction_id": Text, "notes": Text, "paid_by": Text, "received_by": Int,
);
const USER_DEVICES: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "user_id": Int, "device_name": Text, "device_type": Text,
    "device_platform": Text, "device_serial": Text, "is_active": Int, "enrolled_at": Int,
    "last_seen": Int,
);
const ATTENDANCE: &[(&str, ColumnKind)] = columns!(
    "id": Int, "clinic_id": Int, "user_id": Int, "date": Text, "check_in": Int, "check_out": Int,
    "status": Text, "notes": Text,
);

impl SyncTable {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SyncTable::Clinics => "clinics",
            SyncTable::Users => "users",
            SyncTable::TreatmentTypes => "treatment_types",
            SyncTable::ReferringDoctors => "referring_doctors",
            SyncTable::ScanTypes => "scan_types",
            SyncTable::Patients => "patients",
            SyncTable::Appointments => "appointments",
            SyncTable::Reports => "reports",
            SyncTable::Payments => "payments",
            SyncTable::UserDevices => "user_devices",
            SyncTable::Attendance => "attendance",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        SYNC_TABLES.into_iter().find(|t| t.name() == name)
    }

    /// Column carrying the tenant: the clinic row is its own tenant.
    #[must_use]
    pub fn tenant_column(self) -> &'static str {
        match self {
            SyncTable::Clinics => "id",
            _ => "clinic_id",
        }
    }

    /// Tables whose rows carry a human-facing `display_id`.
    #[must_use]
    pub fn has_display_id(self) -> bool {
        matches!(self, SyncTable::Patients | SyncTable::Reports | SyncTable::Payments)
    }

    /// Known columns and their storage kinds.
    #[must_use]
    pub fn columns(self) -> &'static [(&'static str, ColumnKind)] {
        match self {
            SyncTable::Clinics => CLINICS,
            SyncTable::Users => USERS,
            SyncTable::TreatmentTypes | SyncTable::ScanTypes => PRICED,
            SyncTable::ReferringDoctors => REFERRING_DOCTORS,
            SyncTable::Patients => PATIENTS,
            SyncTable::Appointments => APPOINTMENTS,
            SyncTable::Reports => REPORTS,
            SyncTable::Payments => PAYMENTS,
            SyncTable::UserDevices => USER_DEVICES,
            SyncTable::Attendance => ATTENDANCE,
        }
    }

    #[must_use]
    pub fn kind_of(self, column: &str) -> Option<ColumnKind> {
        self.columns().iter().find(|(c, _)| *c == column).map(|(_, k)| *k)
    }

    /// Foreign keys to other replicated tables (`column → parent`).
    #[must_use]
    pub fn references(self) -> &'static [(&'static str, SyncTable)] {
        match self {
            SyncTable::Clinics => &[],
            SyncTable::Users
            | SyncTable::TreatmentTypes
            | SyncTable::ReferringDoctors
            | SyncTable::ScanTypes => &[("clinic_id", SyncTable::Clinics)],
            SyncTable::Patients => &[("clinic_id", SyncTable::Clinics)],
            SyncTable::Appointments => &[
                ("clinic_id", SyncTable::Clinics),
                ("patient_id", SyncTable::Patients),
                ("doctor_id", SyncTable::Users),
            ],
            SyncTable::Reports => &[("clinic_id", SyncTable::Clinics), ("patient_id", SyncTable::Patients)],
            SyncTable::Payments => &[
                ("clinic_id", SyncTable::Clinics),
                ("patient_id", SyncTable::Patients),
                ("report_id", SyncTable::Reports),
                ("treatment_type_id", SyncTable::TreatmentTypes),
                ("received_by", SyncTable::Users),
            ],
            SyncTable::UserDevices | SyncTable::Attendance => {
                &[("clinic_id", SyncTable::Clinics), ("user_id", SyncTable::Users)]
            }
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
