// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain entities, their create/patch payloads and list helpers.
//!
//! `Create*` payloads carry what a caller may set on insert; `Update*`
//! payloads are the per-entity whitelist for partial updates. Any JSON field
//! not named in an `Update*` struct is dropped by deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::permissions::{PermissionMap, Role};

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: DEFAULT_PAGE_SIZE }
    }
}

impl Pagination {
    #[must_use]
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }

    #[must_use]
    pub fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.offset() == 0 && self.limit() == DEFAULT_PAGE_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

// ---------------------------------------------------------------------------
// Sync marker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Local,
    Synced,
    Conflict,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    /// Unknown markers are treated as not yet pushed.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "synced" => SyncStatus::Synced,
            "conflict" => SyncStatus::Conflict,
            _ => SyncStatus::Local,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub created_at: i64,
    pub updated_at: i64,
    pub synced_at: Option<i64>,
    pub sync_status: SyncStatus,
}

// ---------------------------------------------------------------------------
// Small string enums
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value { $($text => Some($name::$variant),)+ _ => None }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(ClinicStatus { Active => "active", Suspended => "suspended", Cancelled => "cancelled" });
string_enum!(ReportStatus { Draft => "draft", Finalized => "finalized" });
string_enum!(PaymentStatus { Pending => "pending", Success => "success", Failed => "failed", Refunded => "refunded" });
string_enum!(AppointmentStatus {
    Confirmed => "confirmed",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
});

impl PaymentStatus {
    /// pending → success | failed, success → refunded. Nothing else moves.
    #[must_use]
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Success)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Success, PaymentStatus::Refunded)
        )
    }
}

impl AppointmentStatus {
    /// Only a confirmed appointment can move, and only once.
    #[must_use]
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        self == AppointmentStatus::Confirmed && next != AppointmentStatus::Confirmed
    }
}

// ---------------------------------------------------------------------------
// Clinic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clinic {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub gst_number: Option<String>,
    pub specialization: String,
    pub subscription_plan: String,
    pub status: ClinicStatus,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateClinic {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub gst_number: Option<String>,
    pub specialization: Option<String>,
    pub subscription_plan: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateClinic {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub gst_number: Option<String>,
    pub specialization: Option<String>,
    pub subscription_plan: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClinicStats {
    pub patients: i64,
    pub reports: i64,
    pub finalized_reports: i64,
    pub payments: i64,
    pub appointments: i64,
    pub staff: i64,
    pub revenue: f64,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub clinic_id: Option<i64>,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub permissions: PermissionMap,
    pub is_active: bool,
    pub created_by: Option<i64>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub permissions: PermissionMap,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserStats {
    pub total: i64,
    pub active: i64,
    pub by_role: BTreeMap<String, i64>,
}

// ---------------------------------------------------------------------------
// Patient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub clinic_id: i64,
    pub display_id: String,
    pub name: String,
    pub age: i64,
    pub gender: String,
    pub village: String,
    pub phone: String,
    pub referred_by: String,
    pub treatment_type: String,
    pub notes: Option<String>,
    pub payment_type: String,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePatient {
    pub name: String,
    #[serde(default)]
    pub age: i64,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub village: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub referred_by: String,
    #[serde(default)]
    pub treatment_type: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub payment_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdatePatient {
    pub name: Option<String>,
    pub age: Option<i64>,
    pub gender: Option<String>,
    pub village: Option<String>,
    pub phone: Option<String>,
    pub referred_by: Option<String>,
    pub treatment_type: Option<String>,
    pub notes: Option<String>,
    pub payment_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatientFilter {
    /// Substring of name or phone
    pub search: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatientStats {
    pub total: i64,
    pub by_gender: BTreeMap<String, i64>,
    pub by_treatment: BTreeMap<String, i64>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: i64,
    pub clinic_id: i64,
    pub patient_id: i64,
    pub display_id: String,
    pub content: Option<String>,
    pub docx_url: Option<String>,
    pub pdf_url: Option<String>,
    pub status: ReportStatus,
    pub send_count: i64,
    pub finalized_at: Option<i64>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReport {
    pub patient_id: i64,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateReport {
    pub content: Option<String>,
}

/// Rendered outputs attached when a report is finalized.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportArtifacts {
    pub docx_url: Option<String>,
    pub pdf_url: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportFilter {
    pub patient_id: Option<i64>,
    pub status: Option<ReportStatus>,
}

// ---------------------------------------------------------------------------
// Payment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub clinic_id: i64,
    pub patient_id: i64,
    pub report_id: Option<i64>,
    pub treatment_type_id: Option<i64>,
    pub display_id: String,
    pub amount: f64,
    pub payment_method: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
    pub paid_by: Option<String>,
    pub received_by: Option<i64>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePayment {
    pub patient_id: i64,
    #[serde(default)]
    pub report_id: Option<i64>,
    #[serde(default)]
    pub treatment_type_id: Option<i64>,
    pub amount: f64,
    pub payment_method: String,
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub paid_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdatePayment {
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
    pub paid_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaymentFilter {
    pub patient_id: Option<i64>,
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RevenueSummary {
    pub collected: f64,
    pub pending: f64,
    pub refunded: f64,
    pub payments: i64,
}

// ---------------------------------------------------------------------------
// Appointment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub clinic_id: i64,
    pub patient_id: Option<i64>,
    pub patient_name: String,
    pub patient_email: Option<String>,
    pub patient_phone: Option<String>,
    pub doctor_id: Option<i64>,
    pub treatment: String,
    /// YYYY-MM-DD
    pub appointment_date: String,
    /// HH:MM
    pub start_time: String,
    pub end_time: String,
    pub duration: i64,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub created_by: Option<i64>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAppointment {
    #[serde(default)]
    pub patient_id: Option<i64>,
    pub patient_name: String,
    #[serde(default)]
    pub patient_email: Option<String>,
    #[serde(default)]
    pub patient_phone: Option<String>,
    #[serde(default)]
    pub doctor_id: Option<i64>,
    #[serde(default)]
    pub treatment: String,
    pub appointment_date: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateAppointment {
    pub patient_name: Option<String>,
    pub patient_email: Option<String>,
    pub patient_phone: Option<String>,
    pub doctor_id: Option<i64>,
    pub treatment: Option<String>,
    pub appointment_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppointmentFilter {
    pub date: Option<String>,
    pub doctor_id: Option<i64>,
    pub status: Option<AppointmentStatus>,
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// Scan types and treatment types share one shape: a priced catalogue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    pub clinic_id: i64,
    pub name: String,
    pub price: f64,
    pub is_active: bool,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCatalogItem {
    pub name: String,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateCatalogItem {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferringDoctor {
    pub id: i64,
    pub clinic_id: i64,
    pub name: String,
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReferringDoctor {
    pub name: String,
    #[serde(default)]
    pub hospital: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateReferringDoctor {
    pub name: Option<String>,
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub is_active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Devices & attendance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDevice {
    pub id: i64,
    pub clinic_id: i64,
    pub user_id: i64,
    pub device_name: String,
    pub device_type: String,
    pub device_platform: Option<String>,
    pub device_serial: Option<String>,
    pub is_active: bool,
    pub enrolled_at: i64,
    pub last_seen: Option<i64>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollDevice {
    /// Defaults to the caller
    #[serde(default)]
    pub user_id: Option<i64>,
    pub device_name: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub device_platform: Option<String>,
    #[serde(default)]
    pub device_serial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendance {
    pub id: i64,
    pub clinic_id: i64,
    pub user_id: i64,
    /// YYYY-MM-DD in clinic local time
    pub date: String,
    pub check_in: i64,
    pub check_out: Option<i64>,
    pub status: String,
    pub notes: Option<String>,
    #[serde(flatten)]
    pub marker: SyncMarker,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AttendanceFilter {
    pub date: Option<String>,
    pub user_id: Option<i64>,
}
