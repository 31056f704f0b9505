//! Pluggable retry policy for transient failures.
//!
//! Distinct from the single encryption retry the driver performs itself:
//! this policy governs user-visible transient failures (deadlock victim,
//! resource throttling, timeouts) and decides the backoff before another
//! attempt. The default policy never retries.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::Error;

/// Decides whether a failed attempt is retried and after what backoff.
pub trait RetryPolicy: Send + Sync {
    /// The backoff before attempt `attempt + 1`, or `None` to give up.
    ///
    /// `attempt` is 1-based: the first failure passes `1`.
    fn next_delay(&self, error: &Error, attempt: u32) -> Option<Duration>;
}

/// The default policy: no retries.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _error: &Error, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Fixed-count retries with exponential backoff.
pub struct ExponentialBackoff {
    /// Maximum number of retries granted.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles each time.
    pub base_delay: Duration,
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, _error: &Error, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        Some(self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

static DEFAULT_POLICY: OnceLock<Arc<dyn RetryPolicy>> = OnceLock::new();

/// Install the process-wide default policy. One-shot: later calls fail.
pub fn set_default_policy(policy: Arc<dyn RetryPolicy>) -> Result<(), Arc<dyn RetryPolicy>> {
    DEFAULT_POLICY.set(policy)
}

/// The process-wide default policy ([`NoRetry`] unless installed).
#[must_use]
pub fn default_policy() -> Arc<dyn RetryPolicy> {
    DEFAULT_POLICY
        .get_or_init(|| Arc::new(NoRetry))
        .clone()
}

/// Whether an error is a transient failure the policy may act on.
///
/// Covers the well-known transient server errors (deadlock victim,
/// Azure throttling, failover) plus timeouts and broken connections.
#[must_use]
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Timeout | Error::ReconnectTimeout | Error::ConnectionBroken(_) => true,
        Error::Server(fault) => matches!(
            fault.number,
            1205        // deadlock victim
            | -2        // timeout
            | 10928 | 10929 // resource limits
            | 40197 | 40501 | 40613 // service errors / busy / unavailable
            | 49918 | 49919 | 49920 // cannot process request
            | 4060 // cannot open database during failover
        ),
        _ => false,
    }
}
