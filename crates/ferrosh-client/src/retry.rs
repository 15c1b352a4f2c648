use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::Error;

/// Exponential-backoff retry policy for `execute`. The handshake and pool
/// open are never retried through this; only transient execution errors
/// are.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `attempt` (1-based, already failed) should be retried.
    pub fn should_retry(&self, attempt: u32, error: &Error) -> bool {
        attempt < self.max_attempts && error.retryable()
    }

    /// Delay before the given (1-based) retry attempt: doubling from
    /// `base_delay`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Circuit breaker configuration: open after `failure_threshold`
/// consecutive failures, half-open after `cooldown`.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Classic three-state breaker. `check` gates a call, `record_*` reports
/// its outcome; a half-open probe failing re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Gate a call. `Err(CircuitOpen)` while open; transitions to half-open
    /// after the cooldown, admitting a single probe.
    pub fn check(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    debug!("circuit breaker half-open; admitting a probe");
                    *state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                }
            }
            BreakerState::HalfOpen => {
                warn!("half-open probe failed; circuit breaker re-opened");
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_only_transient_kinds() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &Error::Timeout));
        assert!(policy.should_retry(1, &Error::transport("reset", true)));
        assert!(!policy.should_retry(1, &Error::transport("400", false)));
        assert!(!policy.should_retry(1, &Error::AuthFailed("no".into())));
        assert!(!policy.should_retry(3, &Error::Timeout)); // attempts exhausted
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(8), Duration::from_millis(500));
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(0),
        });

        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();

        // Cooldown of zero: immediately half-open, single probe admitted.
        assert!(breaker.check().is_ok());
        breaker.record_failure();

        // Re-opened by the failed probe; zero cooldown half-opens again.
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn breaker_fails_fast_while_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(3600),
        });
        breaker.record_failure();
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen)));
    }
}
