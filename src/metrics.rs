// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics through the `metrics` facade. Installing an exporter is up to the
//! embedding process; without one every call is a no-op.
//!
//! Names carry the `clinic_core_` prefix, counters end in `_total` and
//! durations in `_seconds`.
//!
//! | Metric | Labels |
//! |---|---|
//! | `clinic_core_operations_total` | entity, operation, status |
//! | `clinic_core_operation_seconds` | entity, operation |
//! | `clinic_core_errors_total` | component, operation, error_type |
//! | `clinic_core_connection_errors_total` | backend |
//! | `clinic_core_backend_healthy` | backend |
//! | `clinic_core_circuit_breaker_calls_total` | circuit, outcome |
//! | `clinic_core_cache_total` | outcome |
//! | `clinic_core_cache_invalidated_keys_total` | |
//! | `clinic_core_display_ids_issued_total` | prefix |
//! | `clinic_core_display_id_retries_total` | prefix |
//! | `clinic_core_sync_rows_total` | table, direction |
//! | `clinic_core_sync_conflicts_total` | table |
//! | `clinic_core_sync_passes_total` | table, mode, status |
//! | `clinic_core_sync_pass_seconds` | table |
//! | `clinic_core_sync_coalesced_total` | table |
//! | `clinic_core_sync_pending_rows` | table |
//! | `clinic_core_startup_seconds` | phase |

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

fn label(value: &str) -> String {
    value.to_owned()
}

// Repositories

/// `status` is "success" or the error kind.
pub fn record_operation(entity: &str, operation: &str, status: &str) {
    let labels = [("entity", label(entity)), ("operation", label(operation)), ("status", label(status))];
    counter!("clinic_core_operations_total", &labels).increment(1);
}

/// Records `clinic_core_operation_seconds` when dropped.
#[must_use = "the timer records when dropped"]
pub struct OperationTimer {
    entity: &'static str,
    operation: &'static str,
    started: Instant,
}

impl OperationTimer {
    pub fn start(entity: &'static str, operation: &'static str) -> Self {
        Self { entity, operation, started: Instant::now() }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let labels = [("entity", label(self.entity)), ("operation", label(self.operation))];
        histogram!("clinic_core_operation_seconds", &labels).record(self.started.elapsed().as_secs_f64());
    }
}

// Errors and backends

pub fn record_error(component: &str, operation: &str, error_type: &str) {
    let labels = [("component", label(component)), ("operation", label(operation)), ("error_type", label(error_type))];
    counter!("clinic_core_errors_total", &labels).increment(1);
}

pub fn record_connection_error(backend: &str) {
    counter!("clinic_core_connection_errors_total", "backend" => label(backend)).increment(1);
}

pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!("clinic_core_backend_healthy", "backend" => label(backend)).set(f64::from(u8::from(healthy)));
}

/// `outcome`: success, failure, passed (an error that did not count) or rejected.
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    let labels = [("circuit", label(circuit)), ("outcome", label(outcome))];
    counter!("clinic_core_circuit_breaker_calls_total", &labels).increment(1);
}

// Cache

/// `outcome`: hit, miss or error.
pub fn record_cache(outcome: &str) {
    counter!("clinic_core_cache_total", "outcome" => label(outcome)).increment(1);
}

pub fn record_cache_invalidated(keys: usize) {
    counter!("clinic_core_cache_invalidated_keys_total").increment(keys as u64);
}

// Display ids

pub fn record_id_issued(prefix: &str) {
    counter!("clinic_core_display_ids_issued_total", "prefix" => label(prefix)).increment(1);
}

pub fn record_id_retry(prefix: &str) {
    counter!("clinic_core_display_id_retries_total", "prefix" => label(prefix)).increment(1);
}

// Sync

/// `direction` is "pull" or "push".
pub fn record_sync_rows(table: &str, direction: &str, rows: usize) {
    if rows == 0 {
        return;
    }
    let labels = [("table", label(table)), ("direction", label(direction))];
    counter!("clinic_core_sync_rows_total", &labels).increment(rows as u64);
}

pub fn record_sync_conflicts(table: &str, rows: usize) {
    counter!("clinic_core_sync_conflicts_total", "table" => label(table)).increment(rows as u64);
}

pub fn record_sync_pass(table: &str, mode: &str, status: &str, took: Duration) {
    let labels = [("table", label(table)), ("mode", label(mode)), ("status", label(status))];
    counter!("clinic_core_sync_passes_total", &labels).increment(1);
    histogram!("clinic_core_sync_pass_seconds", "table" => label(table)).record(took.as_secs_f64());
}

/// A caller joined a pass already running for the same clinic and table.
pub fn record_sync_coalesced(table: &str) {
    counter!("clinic_core_sync_coalesced_total", "table" => label(table)).increment(1);
}

pub fn set_sync_pending(table: &str, rows: u64) {
    gauge!("clinic_core_sync_pending_rows", "table" => label(table)).set(rows as f64);
}

// Startup

pub fn record_startup_phase(phase: &str, took: Duration) {
    histogram!("clinic_core_startup_seconds", "phase" => label(phase)).record(took.as_secs_f64());
}
