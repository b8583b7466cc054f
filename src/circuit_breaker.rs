//! Circuit breaker for broker and store calls
//!
//! States: Closed (normal), Open (rejecting), HalfOpen (probing recovery).
//! The circuit opens after a run of consecutive failures, rejects calls for
//! a cooldown window, then lets a single probe through; that probe's outcome
//! decides whether the circuit closes again or re-opens.

use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time spent rejecting calls before a probe is allowed
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    config: CircuitBreakerConfig,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            config,
            opened_at: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Check whether a call may be attempted.
    ///
    /// While Open, the first check after the cooldown elapses moves the
    /// circuit to HalfOpen and admits the call as a probe.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    tracing::info!("circuit breaker half-open, probing recovery");
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Closed: resets the failure run. HalfOpen: the probe succeeded, close.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!("circuit breaker closed after successful probe");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    ///
    /// Closed: extends the failure run, opening at the threshold.
    /// HalfOpen: the probe failed, re-open and restart the cooldown.
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = self.failure_count,
                        "circuit breaker opened"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker re-opened, probe failed");
                self.state = CircuitState::Open;
                self.failure_count = 0;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        )
    }

    #[test]
    fn test_starts_closed_and_allows_attempts() {
        let mut cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let mut cb = breaker(3, 60_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_run() {
        let mut cb = breaker(3, 60_000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // The run starts over: two more failures must not open it
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_success_closes() {
        let mut cb = breaker(1, 1);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut cb = breaker(1, 1);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Cooldown restarted: immediate attempts are rejected again
        assert!(!cb.can_attempt());
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker(1, 60_000);
        cb.record_failure();
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
    }
}
