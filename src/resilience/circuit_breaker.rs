// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker over `recloser`.
//!
//! Two backends sit behind one: the cloud sync peer and the Redis cache.
//! While a breaker is open, calls fail immediately with
//! [`CircuitError::Rejected`] instead of waiting on a dead connection; after
//! `recovery_timeout` a few trial calls decide whether it closes again.
//!
//! Not every error is an outage. [`CircuitBreaker::call_when`] lets the
//! caller say which errors count against the breaker, so a unique-key
//! violation from a healthy peer never trips it.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Open breaker; the operation was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Trip and recovery thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive counted failures that open the breaker
    pub failure_threshold: u32,
    /// Trial calls in half-open that must succeed to close it
    pub success_threshold: u32,
    /// Time spent open before trial calls are let through
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::sync_peer()
    }
}

impl CircuitConfig {
    /// The cloud store: a sync tick touches every table, so a dead peer
    /// should trip within one tick and be retried about once a minute.
    #[must_use]
    pub fn sync_peer() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// The cache is optional; tolerate more blips, come back sooner.
    #[must_use]
    pub fn cache() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Call counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub successes: u64,
    /// Errors that counted against the breaker
    pub failures: u64,
    /// Errors the caller classified as answers, not outages
    pub passed_errors: u64,
    pub rejections: u64,
}

/// A named breaker. Outcomes are also reported to the metrics facade as
/// `clinic_core_circuit_breaker_calls_total{circuit, outcome}`.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    successes: AtomicU64,
    failures: AtomicU64,
    passed_errors: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            // Trips only when the whole window failed, i.e. `failure_threshold` in a row
            .error_rate(0.99)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            passed_errors: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker; every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_when(f, |_| true).await
    }

    /// Run `f` through the breaker; only errors for which `trips` returns
    /// true count as failures. The others are returned as
    /// [`CircuitError::Inner`] while the breaker records a success.
    pub async fn call_when<F, Fut, T, E, P>(&self, f: F, trips: P) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let guarded = async {
            match f().await {
                Err(e) if trips(&e) => Err(e),
                answer => Ok(answer),
            }
        };

        match self.inner.call(guarded).await {
            Ok(Ok(value)) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                self.passed_errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_breaker_call(&self.name, "passed");
                Err(CircuitError::Inner(e))
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "circuit open, call rejected");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            passed_errors: self.passed_errors.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum PeerError {
        Down,
        Duplicate,
    }

    fn transient(e: &PeerError) -> bool {
        *e == PeerError::Down
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = CircuitBreaker::new("sync_peer", CircuitConfig::fast());
        let result: Result<i32, CircuitError<PeerError>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.stats(), BreakerStats { successes: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_consecutive_outages_open_the_breaker() {
        let cb = CircuitBreaker::new("sync_peer", CircuitConfig { recovery_timeout: Duration::from_secs(60), ..CircuitConfig::fast() });

        for _ in 0..2 {
            let r: Result<(), _> = cb.call_when(|| async { Err(PeerError::Down) }, transient).await;
            assert!(matches!(r, Err(CircuitError::Inner(PeerError::Down))));
        }
        let r: Result<i32, CircuitError<PeerError>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(r, Err(CircuitError::Rejected)));
        assert_eq!(cb.stats().failures, 2);
        assert_eq!(cb.stats().rejections, 1);
    }

    #[tokio::test]
    async fn test_answers_never_trip() {
        let cb = CircuitBreaker::new("sync_peer", CircuitConfig::fast());

        for _ in 0..5 {
            let r: Result<(), _> = cb.call_when(|| async { Err(PeerError::Duplicate) }, transient).await;
            assert!(matches!(r, Err(CircuitError::Inner(PeerError::Duplicate))));
        }
        let r: Result<i32, CircuitError<PeerError>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(cb.stats().passed_errors, 5);
        assert_eq!(cb.stats().failures, 0);
    }

    #[tokio::test]
    async fn test_recovers_after_timeout() {
        let cb = CircuitBreaker::new("cache", CircuitConfig::fast());
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(|| async { Err(PeerError::Down) }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let r: Result<i32, CircuitError<PeerError>> = cb.call(|| async { Ok(1) }).await;
        assert_eq!(r.unwrap(), 1);
        let r: Result<i32, CircuitError<PeerError>> = cb.call(|| async { Ok(2) }).await;
        assert_eq!(r.unwrap(), 2);
    }

    #[test]
    fn test_presets() {
        let peer = CircuitConfig::sync_peer();
        let cache = CircuitConfig::cache();
        assert!(peer.failure_threshold < cache.failure_threshold);
        assert!(peer.recovery_timeout > cache.recovery_timeout);
        assert_eq!(CircuitConfig::default(), peer);
    }
}
