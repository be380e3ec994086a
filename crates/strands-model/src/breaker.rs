//! Per-service-class circuit breaker.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Admission check. OPEN flips to HALF_OPEN once the recovery timeout
    /// has elapsed since the last failure.
    pub fn can_proceed(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                    tracing::info!(service = self.name, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    tracing::info!(service = self.name, "circuit breaker closed");
                }
            }
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        match self.state {
            BreakerState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.state = BreakerState::Open;
                tracing::warn!(service = self.name, "circuit breaker open");
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                tracing::warn!(service = self.name, "circuit breaker re-opened");
            }
            _ => {}
        }
    }

    /// Seconds until the breaker would admit again; used for `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        match self.state {
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                self.config
                    .recovery_timeout
                    .saturating_sub(elapsed)
                    .as_secs()
                    .max(1)
            }
            _ => 0,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        BreakerStatus {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
}
