//! Retry of operations aborted by global transaction collisions.
//!
//! DDL on global objects (users, roles, connections) makes the database roll back any
//! transaction racing with another such mutation. That one failure is expected under
//! concurrency and safe to retry; every other error is returned immediately.

use crate::error::{ProviderError, ProviderResult, ROLLBACK_MARKER};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 50;
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;

/// True iff `message` begins with the collision marker.
pub fn is_rollback_message(message: &str) -> bool {
    message.starts_with(ROLLBACK_MARKER)
}

/// True iff `err` is a transaction collision.
///
/// Backends already tag collisions as [`ProviderError::TransactionCollision`]; the message
/// check covers errors that reached us untagged.
pub fn is_rollback_error(err: Option<&ProviderError>) -> bool {
    match err {
        None => false,
        Some(e) if e.is_transaction_collision() => true,
        Some(e) => is_rollback_message(&e.to_string()),
    }
}

/// How collisions are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Immediate retries with no cap, matching the historical busy loop.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Bounded exponential backoff.
    pub fn bounded(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
    }
}

/// Run `op` until it returns something other than a transaction collision.
///
/// Collisions are retried according to `policy`. When attempts run out the last collision
/// is wrapped in [`ProviderError::RetriesExhausted`]; when `cancel` fires the loop stops
/// with [`ProviderError::Cancelled`].
pub async fn run_and_retry_rollbacks<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        attempt += 1;

        let err = match op().await {
            Err(e) if is_rollback_error(Some(&e)) => e,
            other => return other,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(attempts = attempt, "Giving up on transaction collisions");
            return Err(ProviderError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Transaction collision, retrying");
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            // Keep the legacy loop from starving other tasks on the same worker
            tokio::task::yield_now().await;
        }
    }
}
