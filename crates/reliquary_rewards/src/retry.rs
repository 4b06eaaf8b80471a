//! # Transient-Failure Retry
//!
//! Re-runs a whole operation when it fails with a transient error
//! (`LockTimeout`, `StorageUnavailable`, `Journal`). The delay doubles after
//! each attempt and is capped. Business and configuration errors return
//! immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retry.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `max_attempts` is zero or the cap is below the
    /// initial delay.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(EngineError::InvalidConfig(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or attempts run out.
///
/// # Errors
///
/// The last error returned by `op`.
pub fn with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt - 1);
                tracing::warn!(
                    "attempt {}/{} failed: {}, retrying in {:?}",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(160));
        assert_eq!(policy.backoff(5), Duration::from_millis(200));
        assert_eq!(policy.backoff(200), Duration::from_millis(200));
    }

    #[test]
    fn test_transient_error_is_retried() {
        let mut calls = 0;
        let result = with_retry(&fast(), || {
            calls += 1;
            if calls < 3 {
                Err(EngineError::LockTimeout {
                    resource: "row".into(),
                })
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let mut calls = 0;
        let result: EngineResult<()> = with_retry(&fast(), || {
            calls += 1;
            Err(EngineError::StorageUnavailable("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_business_error_is_not_retried() {
        let mut calls = 0;
        let result: EngineResult<()> = with_retry(&fast(), || {
            calls += 1;
            Err(EngineError::CampaignNotFound(1))
        });
        assert_eq!(result, Err(EngineError::CampaignNotFound(1)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::none().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }
}
