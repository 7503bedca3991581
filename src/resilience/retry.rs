// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! ```
//! use clinic_core::RetryConfig;
//! use std::time::Duration;
//!
//! let ids = RetryConfig::id_generation(5);
//! assert_eq!(ids.max_attempts, 5);
//! assert_eq!(ids.delay_for(1), Duration::from_millis(5));
//! assert_eq!(ids.delay_for(2), Duration::from_millis(10));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff schedule. Every preset gives up eventually; nothing in the
/// request path or the sync loop may wait on a backend forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first, at least 1
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Opening pools and applying the schema at boot. A wrong URL should
    /// fail the process within a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// One statement that hit a busy or briefly unreachable database.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Display-id collisions clear within a few milliseconds once the
    /// sequence row has been bumped past rows that arrived by sync.
    #[must_use]
    pub fn id_generation(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn instant(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
        }
    }

    /// Wait after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay
    }
}

/// Retry `operation` on any error.
pub async fn retry<F, Fut, T, E>(operation: &str, config: &RetryConfig, attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation, config, |_| true, attempt).await
}

/// Retry `operation` while `retryable` accepts the error. Anything else
/// (constraint violations, bad input) is returned after the first attempt.
pub async fn retry_when<F, Fut, T, E, P>(
    operation: &str,
    config: &RetryConfig,
    retryable: P,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max = config.max_attempts.max(1);
    let mut n = 0;
    loop {
        n += 1;
        match attempt().await {
            Ok(value) => {
                if n > 1 {
                    debug!(operation, attempts = n, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if n < max && retryable(&err) => {
                let delay = config.delay_for(n);
                warn!(operation, attempt = n, max, error = %err, ?delay, "retrying");
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum DbError {
        Locked,
        Unique,
    }

    impl std::fmt::Display for DbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(match self {
                DbError::Locked => "database is locked",
                DbError::Unique => "unique violation",
            })
        }
    }

    #[tokio::test]
    async fn test_lock_clears_on_third_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry("insert_patient", &RetryConfig::instant(3), || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(DbError::Locked),
                _ => Ok("MRN-2025-00001"),
            }
        })
        .await;

        assert_eq!(result.unwrap(), "MRN-2025-00001");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), DbError> = retry("ping", &RetryConfig::instant(4), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::Locked)
        })
        .await;

        assert_eq!(result.unwrap_err(), DbError::Locked);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), DbError> = retry_when(
            "insert_patient",
            &RetryConfig::instant(5),
            |e| *e == DbError::Locked,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::Unique)
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), DbError::Unique);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig { max_attempts: 0, ..RetryConfig::instant(1) };
        let _: Result<(), DbError> = retry("ping", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::Locked)
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_presets_are_bounded() {
        assert_eq!(RetryConfig::startup().max_attempts, 5);
        assert_eq!(RetryConfig::query().max_attempts, 3);
        assert_eq!(RetryConfig::id_generation(0).max_attempts, 1);
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(300));
        assert_eq!(config.delay_for(9), Duration::from_millis(300));
    }
}
