//! Decision model: redeliver or quarantine a failed event.
//!
//! The Decider is a pure function of (envelope, failure report, now). The
//! retry coordinator executes the decision against the store.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::envelope::EventEnvelope;
use super::failure::{Disposition, FailureReport};
use super::topic::Topic;

/// Delay before a redelivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `base * exponent^retry_count`
    Geometric { base: Duration, exponent: f64 },
    /// Same delay for every attempt.
    Fixed(Duration),
}

impl Backoff {
    /// Delay for an event that has already been redelivered `retry_count`
    /// times (0 for the first failure).
    ///
    /// Example with base=5min, exponent=1.5:
    /// - retry_count 0: 5min
    /// - retry_count 1: 7.5min
    /// - retry_count 2: 11.25min
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Geometric { base, exponent } => {
                let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
                let secs = base.as_secs_f64() * exponent.powi(exp);
                // overflow / NaN は上限に丸める
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        }
    }
}

/// Retry policy for failed events.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Redeliveries allowed before an event is hospitalized.
    pub max_retry: u32,
    pub backoff: Backoff,
    /// Topics that re-poll on a fixed schedule instead of backing off.
    pub fixed_schedules: HashMap<Topic, Duration>,
}

impl Default for RetryPolicy {
    /// maxRetry 3, base 5 minutes, exponent 1.5.
    fn default() -> Self {
        Self {
            max_retry: 3,
            backoff: Backoff::Geometric {
                base: Duration::from_secs(5 * 60),
                exponent: 1.5,
            },
            fixed_schedules: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, topic: &Topic, retry_count: u32) -> Duration {
        match self.fixed_schedules.get(topic) {
            Some(delay) => *delay,
            None => self.backoff.delay(retry_count),
        }
    }
}

/// The next action for a failed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Insert a new outbox row with `retry_count + 1`.
    Redeliver { scheduled_for: DateTime<Utc> },

    /// Write a hospital record and stop.
    Quarantine { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(
        &self,
        envelope: &EventEnvelope,
        report: &FailureReport,
        now: DateTime<Utc>,
    ) -> Decision;
}

/// Budget-based decider:
/// - quarantine when the failing side asked for it
/// - redeliver while `retry_count < max_retry`
/// - quarantine once the budget is spent
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for DefaultDecider {
    fn decide(
        &self,
        envelope: &EventEnvelope,
        report: &FailureReport,
        now: DateTime<Utc>,
    ) -> Decision {
        if report.disposition == Disposition::Quarantine {
            return Decision::Quarantine {
                reason: format!("{} is not retryable", report.reason),
            };
        }

        if envelope.retry_count() >= self.policy.max_retry {
            return Decision::Quarantine {
                reason: format!(
                    "retry budget exhausted: {}/{}",
                    envelope.retry_count(),
                    self.policy.max_retry
                ),
            };
        }

        let scheduled_for = match report.schedule {
            Some(at) => at,
            None => {
                let delay = self
                    .policy
                    .next_delay(envelope.topic(), envelope.retry_count());
                add_delay(now, delay)
            }
        };
        Decision::Redeliver { scheduled_for }
    }
}

/// `now + delay`, saturating at the far future.
pub fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
