// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Resilience primitives (retry policy + circuit breaker)
//!
//! Only transient failures ([`LagoonError::is_transient`]) are retried and
//! counted toward the breaker; application-level errors propagate
//! immediately. Retries are an explicit attempt loop so cancellation is
//! checked per iteration and the call stack stays flat.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::random;
// tokio's Instant so breaker timers and deadlines follow the runtime clock
// (including test-paused time)
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lagoon_core::{LagoonError, Result};

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant,
    Linear,
    Exponential,
}

/// Retry schedule for one class of remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor for [`Backoff::Exponential`]
    pub multiplier: f64,
    /// Jitter fraction; 0.25 spreads each delay by up to ±25%
    pub jitter: f64,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
            backoff: Backoff::Exponential,
        }
    }

    pub fn constant(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            backoff: Backoff::Constant,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            backoff: Backoff::Constant,
        }
    }

    /// Delay before retrying after `attempt` (0-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Constant => self.initial_delay.as_secs_f64(),
            Backoff::Linear => self.initial_delay.as_secs_f64() * (attempt + 1) as f64,
            Backoff::Exponential => {
                self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32)
            }
        };
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive transient failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe
    pub break_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Observable breaker state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-deployment circuit breaker. All transitions are synchronous under a
/// single mutex; at most one probe is admitted while half-open.
pub struct CircuitBreaker {
    state: Mutex<State>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.state.lock() {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Admission check. Fails fast with [`LagoonError::CircuitOpen`] while
    /// open; when the break duration has elapsed, admits exactly one caller
    /// as the half-open probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    debug!("circuit half-open, admitting probe");
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(LagoonError::CircuitOpen {
                        retry_after: until - now,
                    })
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    Err(LagoonError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Report a successful call admitted by [`try_acquire`](Self::try_acquire).
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::HalfOpen { .. }) {
            debug!("circuit closed after successful probe");
        }
        *state = State::Closed { failures: 0 };
    }

    /// Report a transient failure. Opens the circuit at the threshold, and
    /// restarts the break timer on a failed probe.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(failures, "circuit opened");
                    *state = State::Open {
                        until: Instant::now() + self.config.break_duration,
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen { .. } => {
                warn!("probe failed, circuit re-opened");
                *state = State::Open {
                    until: Instant::now() + self.config.break_duration,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Give back an admission without counting it either way, e.g. when the
    /// call was cancelled or failed with a non-transient error. Without this
    /// a cancelled probe would wedge the breaker half-open forever.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if let State::HalfOpen { probe_in_flight: true } = *state {
            *state = State::HalfOpen {
                probe_in_flight: false,
            };
        }
    }
}

/// Runs one operation under the retry policy and circuit breaker.
#[derive(Clone)]
pub struct Coordinator {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    attempt_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            attempt_timeout: None,
        }
    }

    /// Bound each individual attempt; the retry sequence as a whole is only
    /// bounded when the caller passes a deadline to [`execute`](Self::execute).
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation`, retrying transient failures per the policy.
    ///
    /// Cancellation is honored before every attempt and during every backoff
    /// sleep, and never converted into a retry. Retry exhaustion surfaces
    /// the last observed error. When `deadline` is given the remaining
    /// budget is recomputed before each sleep and each attempt; a deadline
    /// that was already spent on entry yields [`LagoonError::Timeout`]
    /// without invoking `operation`. A `max_attempts` of zero is treated
    /// as one.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut last_error: Option<LagoonError> = None;

        for attempt in 0..self.policy.max_attempts.max(1) {
            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt - 1);
                let delay = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        delay.min(remaining)
                    }
                    None => delay,
                };
                debug!(attempt, ?delay, "retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LagoonError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(LagoonError::Cancelled);
            }
            // deadline budget is recomputed before each attempt as well as
            // each sleep; a spent budget surfaces the last observed error
            if let Some(deadline) = deadline {
                if deadline.saturating_duration_since(Instant::now()).is_zero() {
                    break;
                }
            }

            self.breaker.try_acquire()?;

            match self.run_attempt(cancel, deadline, &mut operation).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(LagoonError::Cancelled) => {
                    self.breaker.release();
                    return Err(LagoonError::Cancelled);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.record_failure();
                    debug!(error = %err, attempt, "transient failure");
                    last_error = Some(err);
                }
                Err(err) => {
                    self.breaker.release();
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LagoonError::Timeout {
            elapsed: started.elapsed(),
        }))
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        operation: &mut F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let budget = match (self.attempt_timeout, remaining) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (Some(a), None) => Some(a),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };

        match budget {
            Some(limit) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(LagoonError::Cancelled),
                    outcome = tokio::time::timeout(limit, operation()) => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(LagoonError::Timeout { elapsed: limit }),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(LagoonError::Cancelled),
                    result = operation() => result,
                }
            }
        }
    }
}
