// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error kinds surfaced by the core.
//!
//! Every public operation returns [`CoreError`]. Backend-specific failures
//! arrive as [`StorageError`](crate::db::StorageError) and are folded in via
//! `From`, so repository code can use `?` throughout.

use thiserror::Error;

use crate::db::StorageError;
use crate::permissions::{Action, Section};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("user is not attached to a clinic")]
    NoTenant,

    #[error("account or clinic is not active")]
    Inactive,

    #[error("permission denied: {section}.{action}")]
    Forbidden { section: Section, action: Action },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict on field '{field}'")]
    Conflict { field: String },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("display id space exhausted for {prefix}-{year}")]
    IdExhausted { prefix: &'static str, year: i32 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("incompatible row in '{table}': unknown column '{column}'")]
    Incompatible { table: String, column: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Transient errors are worth retrying on the next tick or by an idempotent caller.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NoTenant => "no_tenant",
            Self::Inactive => "inactive",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::InvalidReference(_) => "invalid_reference",
            Self::Validation(_) => "validation",
            Self::IdExhausted { .. } => "id_exhausted",
            Self::Unavailable(_) => "unavailable",
            Self::Incompatible { .. } => "incompatible",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => CoreError::Internal("row vanished mid-operation".into()),
            StorageError::Unique { field } => CoreError::Conflict { field },
            StorageError::ForeignKey(msg) => CoreError::InvalidReference(msg),
            StorageError::Unavailable(msg) => CoreError::Unavailable(msg),
            StorageError::Incompatible { table, column } => CoreError::Incompatible { table, column },
            StorageError::Backend(msg) => CoreError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_core_kinds() {
        let e: CoreError = StorageError::Unique { field: "email".into() }.into();
        assert!(matches!(e, CoreError::Conflict { ref field } if field == "email"));

        let e: CoreError = StorageError::ForeignKey("patient_id".into()).into();
        assert_eq!(e.kind(), "invalid_reference");

        let e: CoreError = StorageError::Unavailable("pool timed out".into()).into();
        assert!(e.is_transient());
    }

    #[test]
    fn test_forbidden_display_names_section_and_action() {
        let e = CoreError::Forbidden { section: Section::Billing, action: Action::Edit };
        assert_eq!(e.to_string(), "permission denied: billing.edit");
    }
}
