//! Retry Policy
//!
//! Pure decision logic over an explicit [`RetryState`]. The policy never owns a
//! timer: callers await [`RetryPolicy::next_delay`] themselves and invoke the
//! operation again.
//!
//! Every attempt in a cycle waits the same base delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Default retry ceiling per cycle
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Retry bookkeeping for one attempt cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_delay: Duration,

    /// Set while an attempt is running
    pub in_flight: bool,
}

impl RetryState {
    /// No further automatic attempts allowed
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Bounded retry policy with a fixed delay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` must be at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ReconcileError::Config("max_attempts must be > 0".into()));
        }
        Ok(Self {
            max_attempts,
            base_delay,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let base_delay = std::env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(DEFAULT_BASE_DELAY, Duration::from_millis);

        Self {
            max_attempts,
            base_delay,
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Fresh state for a new cycle
    pub const fn initial_state(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            next_delay: self.base_delay,
            in_flight: false,
        }
    }

    /// Retry allowed iff attempts remain and nothing is in flight
    pub const fn should_retry(&self, state: &RetryState) -> bool {
        !state.is_exhausted() && !state.in_flight
    }

    pub const fn next_delay(&self, _state: &RetryState) -> Duration {
        self.base_delay
    }

    /// Mark an attempt as running. A second concurrent request is rejected.
    pub fn begin_attempt(&self, state: &RetryState, key: &str) -> Result<RetryState> {
        if state.in_flight {
            return Err(ReconcileError::Busy(key.to_string()));
        }
        if state.is_exhausted() {
            return Err(ReconcileError::RetriesExhausted {
                attempts: state.attempt,
                last_error: state.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(RetryState {
            in_flight: true,
            ..state.clone()
        })
    }

    /// Count a failure. `attempt` saturates at `max_attempts`.
    pub fn record_failure(&self, state: &RetryState, error: impl Into<String>) -> RetryState {
        RetryState {
            attempt: (state.attempt + 1).min(state.max_attempts),
            max_attempts: state.max_attempts,
            last_error: Some(error.into()),
            next_delay: self.base_delay,
            in_flight: false,
        }
    }

    /// Reset after a success
    pub const fn record_success(&self, _state: &RetryState) -> RetryState {
        self.initial_state()
    }

    /// Manual retry trigger: clears an exhausted state
    pub const fn reset(&self) -> RetryState {
        self.initial_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::new(0, Duration::ZERO).is_err());
    }

    #[test]
    fn test_attempt_never_exceeds_max() {
        let policy = RetryPolicy::new(3, Duration::from_millis(5)).unwrap();
        let mut state = policy.initial_state();

        for i in 0..10 {
            state = policy.record_failure(&state, format!("failure {i}"));
            assert!(state.attempt <= state.max_attempts);
            if state.attempt >= state.max_attempts {
                assert!(!policy.should_retry(&state));
            }
        }

        assert_eq!(state.attempt, 3);
        assert_eq!(state.last_error.as_deref(), Some("failure 9"));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250)).unwrap();
        let mut state = policy.initial_state();
        for _ in 0..4 {
            state = policy.record_failure(&state, "boom");
            assert_eq!(policy.next_delay(&state), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_success_resets() {
        let policy = RetryPolicy::default();
        let state = policy.record_failure(&policy.initial_state(), "boom");
        let state = policy.record_success(&state);
        assert_eq!(state.attempt, 0);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_in_flight_guard() {
        let policy = RetryPolicy::default();
        let running = policy.begin_attempt(&policy.initial_state(), "p1").unwrap();
        assert!(!policy.should_retry(&running));
        assert!(matches!(
            policy.begin_attempt(&running, "p1"),
            Err(ReconcileError::Busy(_))
        ));
    }

    #[test]
    fn test_exhausted_state_rejects_attempt_until_reset() {
        let policy = RetryPolicy::new(1, Duration::ZERO).unwrap();
        let state = policy.record_failure(&policy.initial_state(), "down");
        assert!(matches!(
            policy.begin_attempt(&state, "p1"),
            Err(ReconcileError::RetriesExhausted { attempts: 1, .. })
        ));
        assert!(policy.begin_attempt(&policy.reset(), "p1").is_ok());
    }
}
