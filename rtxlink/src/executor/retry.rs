//! Retry policies.
//!
//! A policy only ever sees failures already classified by
//! [`FailureKind`]; it decides pacing, not retryability of fatal
//! kinds, which is refused here unconditionally.

use std::time::Duration;

use crate::error::FailureKind;

/// Decides whether and when attempt `attempt + 1` should run after a
/// failure of `kind` on attempt `attempt` (1-based).
pub trait RetryPolicy: Send + Sync {
    /// `None` means give up and surface the error.
    fn next_delay(&self, attempt: u32, kind: FailureKind) -> Option<Duration>;
}

/// Never retry. The safe default for mutating commands.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32, _kind: FailureKind) -> Option<Duration> {
        None
    }
}

/// The same delay between every attempt.
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32, kind: FailureKind) -> Option<Duration> {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        Some(self.delay)
    }
}

/// Doubling backoff from `base`, capped at `cap`.
///
/// The delay sequence is monotonically non-decreasing; routers under
/// reboot or config commit need more slack with each attempt, never
/// less.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, kind: FailureKind) -> Option<Duration> {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap));
        Some(delay)
    }
}
