// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Clinic Core
//!
//! The offline-capable, multi-tenant data plane of a clinic management
//! backend. Each clinic is a tenant; every business operation runs under a
//! [`TenantContext`] and every query it issues is scoped to that clinic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        API (axum)                           │
//! │  • Bearer token → TenantContext                             │
//! │  • Section/action permission check                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Repositories                           │
//! │  • clinic_id predicate on every statement                   │
//! │  • Display ids (MRN/RAD/INV-YYYY-NNNNN)                     │
//! │  • Writes stamp sync_status = 'local'                       │
//! │  • Cache invalidation (Redis or in-process)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Local store (SQLite / PostgreSQL)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                    (SyncEngine, LWW per row)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Cloud store (PostgreSQL)                     │
//! │  • Behind a circuit breaker                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tenant`]: token resolution and the per-request [`TenantContext`]
//! - [`permissions`]: section/action evaluator
//! - [`ids`]: display id generator
//! - [`repository`]: typed, clinic-scoped CRUD
//! - [`sync`]: bidirectional last-writer-wins replication
//! - [`cache`]: optional cache with pattern invalidation
//! - [`api`]: HTTP routes
//! - [`collaborators`]: contracts for object storage and messaging
//! - [`resilience`]: retry and circuit breaking

pub mod api;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod models;
pub mod permissions;
pub mod repository;
pub mod resilience;
pub mod sync;
pub mod tenant;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use api::{router, AppState};
pub use cache::{Cache, CacheStore};
pub use config::{ConfigError, CoreConfig};
pub use db::{Database, StorageError};
pub use error::{CoreError, CoreResult};
pub use ids::{DisplayId, IdGenerator, RecordType};
pub use permissions::{Action, PermissionMap, Role, Section};
pub use repository::Repositories;
pub use resilience::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use sync::{EngineState, SyncEngine, SyncMode, SyncReport, SyncSettings, SyncStore, SyncTable};
pub use tenant::{TenantContext, TenantResolver, UserPrincipal};
