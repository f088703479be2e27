//! Retry and dead-letter policy
//!
//! [`RetryPolicy::decide`] maps an error category and attempt count to an [`Action`].
//! It holds no state; the partition worker owns the attempt counter.

use crate::dlq::DlqReason;
use crate::error::ErrorCategory;
use rand::Rng;
use std::time::Duration;

/// Default number of delivery attempts before a transient failure is parked
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff base
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default backoff cap
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Jitter multiplier range applied to every backoff delay
const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.5;

/// Exponential backoff with multiplicative jitter.
///
/// `delay = min(base * 2^(attempt-1), cap) * U(0.5, 1.5)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Un-jittered delay for the given attempt (1-indexed)
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Delay with a caller-supplied jitter factor, clamped to `[0.5, 1.5]`
    pub fn delay_with_jitter(&self, attempt: u32, factor: f64) -> Duration {
        self.nominal(attempt)
            .mul_f64(factor.clamp(JITTER_MIN, JITTER_MAX))
    }

    /// Delay with a random jitter factor drawn from `U(0.5, 1.5)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, factor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

/// What the worker should do with a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Sleep for the delay, then retry the same message
    Retry(Duration),
    /// Log, count and commit past the message
    Skip,
    /// Publish to the dead-letter topic, then commit past the message
    Park(DlqReason),
}

/// Retry and dead-letter policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Decide using a random jitter factor for retry delays.
    ///
    /// Returns `None` for [`ErrorCategory::Fatal`]: that is not a per-message decision.
    pub fn decide(&self, category: ErrorCategory, attempts: u32) -> Option<Action> {
        let factor = rand::rng().random_range(JITTER_MIN..=JITTER_MAX);
        self.decide_with_jitter(category, attempts, factor)
    }

    /// Deterministic form of [`decide`](Self::decide)
    pub fn decide_with_jitter(
        &self,
        category: ErrorCategory,
        attempts: u32,
        jitter: f64,
    ) -> Option<Action> {
        let action = match category {
            ErrorCategory::Transient if attempts < self.max_attempts => {
                Action::Retry(self.backoff.delay_with_jitter(attempts, jitter))
            }
            ErrorCategory::Transient => Action::Park(DlqReason::TransientExhausted),
            ErrorCategory::Permanent => Action::Park(DlqReason::PermanentFailure),
            ErrorCategory::Decode => Action::Skip,
            ErrorCategory::Oversized => Action::Park(DlqReason::Oversized),
            ErrorCategory::Fatal => return None,
        };
        Some(action)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Backoff::default())
    }
}
