//! Resilience helpers for connector calls.
//!
//! Capped exponential backoff and a per-call timeout that turns an elapsed
//! deadline into a transient [`ConnectorError::ConnectionTimeout`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{ConnectorError, ConnectorResult};

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a given attempt (0-indexed), never above `max`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);
        if capped_ms.is_finite() {
            Duration::from_millis(capped_ms as u64)
        } else {
            self.max
        }
    }
}

/// Run a connector call with a deadline.
///
/// The call is abandoned (dropped) on expiry; connectors are expected to be
/// idempotent by UID, so a late success on the target is harmless.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> ConnectorResult<T>
where
    F: Future<Output = ConnectorResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, "Connector call timed out");
            Err(ConnectorError::ConnectionTimeout { timeout_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_exponential_backoff() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_respects_max() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        };

        // 100 * 2^5 = 3200, capped at 500
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, ConnectorError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed_to_transient_error() {
        let result: ConnectorResult<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionTimeout { timeout_ms: 50 }));
        assert!(err.is_transient());
    }
}
