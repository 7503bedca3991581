// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optional response cache in front of the repositories.
//!
//! Backends implement [`CacheStore`]; the [`Cache`] facade is what the rest
//! of the crate holds. The facade never fails: backend errors are logged,
//! counted and turned into a miss, and a circuit breaker stops calling a
//! backend that keeps failing.
//!
//! # Keys
//!
//! | Key | Holds |
//! |-----|-------|
//! | `patients:clinic:{cid}:{offset}:{limit}` | a patient list page |
//! | `patients:clinic:{cid}:q:{query}:{offset}:{limit}` | a search page |
//! | `patient:{id}` | one patient |
//! | `clinic:{id}` | one clinic |
//! | `user:{id}` | one user |

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::Pagination;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};

pub use memory::MemoryCache;
pub use self::redis::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache connect failed: {0}")]
    Connect(String),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key matching a glob (`*`, `?`). Returns how many went.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    fn backend(&self) -> &'static str;
}

/// Key builders.
pub mod keys {
    use super::Pagination;

    #[must_use]
    pub fn patients_for_clinic(clinic_id: i64) -> String {
        format!("patients:clinic:{clinic_id}")
    }

    /// Everything cached under a clinic's patient lists.
    #[must_use]
    pub fn patients_for_clinic_pattern(clinic_id: i64) -> String {
        format!("patients:clinic:{clinic_id}*")
    }

    #[must_use]
    pub fn patients_page(clinic_id: i64, search: Option<&str>, page: &Pagination) -> String {
        let base = patients_for_clinic(clinic_id);
        match search.map(str::trim).filter(|s| !s.is_empty()) {
            Some(q) => format!("{base}:q:{}:{}:{}", q.to_lowercase(), page.offset(), page.limit()),
            None => format!("{base}:{}:{}", page.offset(), page.limit()),
        }
    }

    #[must_use]
    pub fn patient(id: i64) -> String {
        format!("patient:{id}")
    }

    #[must_use]
    pub fn clinic(id: i64) -> String {
        format!("clinic:{id}")
    }

    #[must_use]
    pub fn clinic_pattern(id: i64) -> String {
        format!("clinic:{id}*")
    }

    #[must_use]
    pub fn user(id: i64) -> String {
        format!("user:{id}")
    }
}

/// Cache facade. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    store: Option<Arc<dyn CacheStore>>,
    breaker: Arc<CircuitBreaker>,
    ttl: Duration,
    clinic_ttl: Duration,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.store.as_ref().map(|s| s.backend()))
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Cache {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, clinic_ttl: Duration) -> Self {
        Self {
            store: Some(store),
            breaker: Arc::new(CircuitBreaker::new("cache", CircuitConfig::cache())),
            ttl,
            clinic_ttl,
        }
    }

    /// No backend: every get misses, every write is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            store: None,
            breaker: Arc::new(CircuitBreaker::new("cache", CircuitConfig::cache())),
            ttl: Duration::ZERO,
            clinic_ttl: Duration::ZERO,
        }
    }

    /// In-process backend with default TTLs.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()), Duration::from_secs(300), Duration::from_secs(600))
    }

    /// Pick a backend from `REDIS_URL`: absent disables caching,
    /// `memory://` selects the in-process map. An unreachable Redis is
    /// logged and caching is disabled.
    pub async fn from_url(url: Option<&str>, ttl: Duration, clinic_ttl: Duration) -> Self {
        match url {
            None => {
                info!("REDIS_URL not set, caching disabled");
                Self::disabled()
            }
            Some(u) if u.starts_with("memory://") => {
                info!("using in-process cache");
                Self::new(Arc::new(MemoryCache::new()), ttl, clinic_ttl)
            }
            Some(u) => match RedisCache::connect(u, Some("clinic:")).await {
                Ok(store) => Self::new(Arc::new(store), ttl, clinic_ttl),
                Err(e) => {
                    warn!(error = %e, "cache unavailable, continuing without it");
                    crate::metrics::record_connection_error("redis");
                    Self::disabled()
                }
            },
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn clinic_ttl(&self) -> Duration {
        self.clinic_ttl
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        match self.breaker.call(|| store.get(key)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(v) => {
                    crate::metrics::record_cache("hit");
                    Some(v)
                }
                Err(e) => {
                    debug!(key, error = %e, "dropping undecodable cache entry");
                    self.delete(key).await;
                    crate::metrics::record_cache("miss");
                    None
                }
            },
            Ok(None) => {
                crate::metrics::record_cache("miss");
                None
            }
            Err(e) => {
                self.absorb("get", e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(store) = self.store.as_ref() else { return };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "cache value not serializable");
                return;
            }
        };
        if let Err(e) = self.breaker.call(|| store.set(key, &raw, ttl)).await {
            self.absorb("set", e);
        }
    }

    pub async fn delete(&self, key: &str) {
        let Some(store) = self.store.as_ref() else { return };
        match self.breaker.call(|| store.delete(key)).await {
            Ok(()) => crate::metrics::record_cache_invalidated(1),
            Err(e) => self.absorb("delete", e),
        }
    }

    pub async fn delete_pattern(&self, pattern: &str) {
        let Some(store) = self.store.as_ref() else { return };
        match self.breaker.call(|| store.delete_pattern(pattern)).await {
            Ok(n) => {
                debug!(pattern, removed = n, "cache pattern invalidated");
                crate::metrics::record_cache_invalidated(n);
            }
            Err(e) => self.absorb("delete_pattern", e),
        }
    }

    /// Drop a patient and every cached list page of its clinic.
    pub async fn invalidate_patient(&self, clinic_id: i64, patient_id: Option<i64>) {
        if let Some(id) = patient_id {
            self.delete(&keys::patient(id)).await;
        }
        self.delete_pattern(&keys::patients_for_clinic_pattern(clinic_id)).await;
    }

    pub async fn invalidate_clinic(&self, clinic_id: i64) {
        self.delete_pattern(&keys::clinic_pattern(clinic_id)).await;
    }

    pub async fn invalidate_user(&self, user_id: i64) {
        self.delete(&keys::user(user_id)).await;
    }

    fn absorb(&self, op: &str, err: CircuitError<CacheError>) {
        let kind = match &err {
            CircuitError::Rejected => "circuit_open",
            CircuitError::Inner(_) => "backend",
        };
        warn!(op, error = %err, "cache call failed, ignoring");
        crate::metrics::record_cache("error");
        crate::metrics::record_error("cache", op, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<usize, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_key_shapes() {
        let page = Pagination::new(50, 25);
        assert_eq!(keys::patients_page(3, None, &page), "patients:clinic:3:50:25");
        assert_eq!(keys::patients_page(3, Some(" Ram "), &page), "patients:clinic:3:q:ram:50:25");
        assert_eq!(keys::patient(9), "patient:9");
        assert_eq!(keys::clinic_pattern(3), "clinic:3*");
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = Cache::disabled();
        cache.set_json("k", &Entry { name: "a".into() }, Duration::from_secs(5)).await;
        assert_eq!(cache.get_json::<Entry>("k").await, None);
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn test_backend_errors_are_absorbed() {
        let cache = Cache::new(Arc::new(FailingStore), Duration::from_secs(5), Duration::from_secs(5));
        cache.set_json("k", &Entry { name: "a".into() }, Duration::from_secs(5)).await;
        assert_eq!(cache.get_json::<Entry>("k").await, None);
        cache.invalidate_patient(1, Some(2)).await;
    }

    #[tokio::test]
    async fn test_patient_invalidation_clears_list_pages() {
        let cache = Cache::in_memory();
        let ttl = cache.ttl();
        let page = Pagination::default();
        cache.set_json(&keys::patient(5), &Entry { name: "p".into() }, ttl).await;
        cache.set_json(&keys::patients_page(1, None, &page), &vec![5], ttl).await;
        cache.set_json(&keys::patients_page(1, Some("ram"), &page), &vec![5], ttl).await;
        cache.set_json(&keys::patients_page(2, None, &page), &vec![7], ttl).await;

        cache.invalidate_patient(1, Some(5)).await;

        assert!(cache.get_json::<Entry>(&keys::patient(5)).await.is_none());
        assert!(cache.get_json::<Vec<i64>>(&keys::patients_page(1, None, &page)).await.is_none());
        assert!(cache.get_json::<Vec<i64>>(&keys::patients_page(1, Some("ram"), &page)).await.is_none());
        assert_eq!(cache.get_json::<Vec<i64>>(&keys::patients_page(2, None, &page)).await, Some(vec![7]));
    }
}
