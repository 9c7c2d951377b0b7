//! Retry accounting and backoff scheduling.
//!
//! A failed delivery is never retried by sleeping inside a worker. Instead the
//! broker parks the job until `BackoffPolicy::delay(attempt)` has elapsed and
//! only then makes it eligible for lease again, so the worker is free to pick
//! up unrelated jobs in the meantime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Default maximum number of delivery attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// Delay function from attempt number to the wait before the next delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay after every failed attempt.
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempt - 1)`, optionally capped.
    Exponential {
        base_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_ms: Option<u64>,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_ms: None,
        }
    }
}

impl BackoffPolicy {
    /// Creates an uncapped exponential policy.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base_ms: base.as_millis() as u64,
            max_ms: None,
        }
    }

    /// Creates a fixed-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Caps the delay of an exponential policy. No effect on fixed policies.
    pub fn with_max_delay(self, max: Duration) -> Self {
        match self {
            Self::Exponential { base_ms, .. } => Self::Exponential {
                base_ms,
                max_ms: Some(max.as_millis() as u64),
            },
            fixed => fixed,
        }
    }

    /// Returns the delay to wait after attempt number `attempt` failed.
    ///
    /// Attempts are 1-based; `0` is treated as `1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let exponent = attempt.max(1) - 1;
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                let millis = base_ms.saturating_mul(factor);
                let millis = max_ms.map_or(millis, |cap| millis.min(cap));
                Duration::from_millis(millis)
            }
        }
    }

    /// Short name used in configuration and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Exponential { .. } => "exponential",
        }
    }
}

/// Attempt ceiling plus backoff, fixed per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Decides what happens to a job whose delivery `attempt` just failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        RetryDecision::for_attempt(attempt, self.max_attempts, &self.backoff)
    }
}

/// Outcome of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the job for `delay`, then redeliver it as `next_attempt`.
    Retry { next_attempt: u32, delay: Duration },
    /// Attempts exhausted; the job is dead-lettered after `attempts` deliveries.
    DeadLetter { attempts: u32 },
}

impl RetryDecision {
    /// Attempt `attempt` failed on a job allowed `max_attempts` deliveries.
    pub fn for_attempt(attempt: u32, max_attempts: u32, backoff: &BackoffPolicy) -> Self {
        let attempt = attempt.max(1);
        if attempt >= max_attempts {
            Self::DeadLetter { attempts: attempt }
        } else {
            Self::Retry {
                next_attempt: attempt + 1,
                delay: backoff.delay(attempt),
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

/// Why a delivery failed, for retry accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The stage handler returned an error.
    Handler(String),
    /// No ack or nack arrived before the lease ran out.
    LeaseExpired,
}

impl FailureCause {
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(message) => write!(f, "{}", message),
            Self::LeaseExpired => write!(f, "lease expired before ack"),
        }
    }
}

impl From<&HandlerError> for FailureCause {
    fn from(err: &HandlerError) -> Self {
        if err.is_lease_expired() {
            Self::LeaseExpired
        } else {
            Self::Handler(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_doubles() {
        let backoff = BackoffPolicy::default();

        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay(3), Duration::from_millis(8000));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn test_exponential_delay_cap() {
        let backoff = BackoffPolicy::exponential(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_delay_saturates() {
        let backoff = BackoffPolicy::exponential(Duration::from_millis(2000));
        assert_eq!(backoff.delay(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_fixed_delay() {
        let backoff = BackoffPolicy::fixed(Duration::from_millis(750));
        assert_eq!(backoff.delay(1), Duration::from_millis(750));
        assert_eq!(backoff.delay(9), Duration::from_millis(750));
        assert_eq!(backoff.with_max_delay(Duration::from_millis(10)), backoff);
    }

    #[test]
    fn test_decide_retries_until_ceiling() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(
            policy.decide(2),
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_millis(4000)
            }
        );
        assert_eq!(policy.decide(3), RetryDecision::DeadLetter { attempts: 3 });
        assert!(policy.decide(3).is_terminal());
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy::new(0, BackoffPolicy::default());
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.decide(1).is_terminal());
    }

    #[test]
    fn test_backoff_serde_shape() {
        let json = serde_json::to_value(BackoffPolicy::default()).expect("serialize");
        assert_eq!(json["type"], "exponential");
        assert_eq!(json["base_ms"], 2000);
        assert!(json.get("max_ms").is_none());

        let parsed: BackoffPolicy =
            serde_json::from_str(r#"{"type":"fixed","delay_ms":50}"#).expect("deserialize");
        assert_eq!(parsed, BackoffPolicy::fixed(Duration::from_millis(50)));
    }

    #[test]
    fn test_failure_cause_from_handler_error() {
        let err = HandlerError::new("twitter rate limited");
        assert_eq!(
            FailureCause::from(&err),
            FailureCause::Handler("twitter rate limited".to_string())
        );
        assert_eq!(
            FailureCause::from(&HandlerError::lease_expired()),
            FailureCause::LeaseExpired
        );
        assert!(FailureCause::LeaseExpired.message().contains("lease"));
    }
}
