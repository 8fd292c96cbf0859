//! Core circuit breaker implementation.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::metrics::{BreakerSnapshot, MetricSink};
use crate::policy::TripPolicy;
use crate::state::{Phase, State, StateManager, Transition};

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner {
    name: String,
    config: BreakerConfig,
    policy: Arc<dyn TripPolicy>,
    clock: Arc<dyn Clock>,
    state: Mutex<StateManager>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
    passthrough: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Admission to run the guarded operation.
///
/// A probe permit dropped before its outcome is recorded hands the probe slot
/// back, so an abandoned probe cannot wedge the breaker in half-open.
struct Permit<'a> {
    inner: &'a BreakerInner,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.inner.state.lock().release_probe();
            debug!(endpoint = %self.inner.name, "Recovery probe abandoned, releasing slot");
        }
    }
}

/// A circuit breaker guarding calls to one named endpoint.
///
/// Cloning is cheap and yields a handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        config: BreakerConfig,
        policy: Arc<dyn TripPolicy>,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
        passthrough: bool,
    ) -> Self {
        info!(
            endpoint = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout_ms,
            passthrough,
            "Creating circuit breaker"
        );

        let now = clock.now();
        let inner = BreakerInner {
            name,
            config,
            policy,
            clock,
            state: Mutex::new(StateManager::new(now)),
            metric_sink,
            hooks,
            passthrough,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for the breaker guarding `name`.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder {
        BreakerBuilder::new(name)
    }

    /// The endpoint name this breaker guards.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The settings the breaker was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Whether this breaker lets every call through.
    pub fn is_passthrough(&self) -> bool {
        self.inner.passthrough
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.inner.state.lock().current()
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.inner.state.lock().consecutive_failures
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> Duration {
        let since = self.inner.state.lock().last_transition;
        self.inner.clock.now().saturating_duration_since(since)
    }

    /// Captures counters and state for observability.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        let next_attempt = state.retry_at();

        BreakerSnapshot {
            state: state.current(),
            failure_count: state.consecutive_failures,
            success_count: state.success_count,
            timeout_count: state.timeout_count,
            rejected_count: state.rejected_count,
            last_failure: state.last_failure,
            next_attempt,
            retry_after: next_attempt.map(|at| at.saturating_duration_since(now)),
        }
    }

    /// Executes a function wrapped by the circuit breaker.
    pub fn call<F, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.pre_call()?;

        let start = Instant::now();
        let result = f();
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.post_call(permit, outcome, start.elapsed());

        result.map_err(BreakerError::Operation)
    }

    /// Checks if a call is allowed and takes the probe slot when one is due.
    fn pre_call<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let inner = &*self.inner;
        if inner.passthrough {
            return Ok(Permit {
                inner,
                probe: false,
                settled: false,
            });
        }

        let now = inner.clock.now();
        let mut state = inner.state.lock();
        let phase = state.phase;

        let (probe, transition) = match phase {
            Phase::Closed => (false, None),
            Phase::Open { retry_at } if now < retry_at => {
                state.rejected_count += 1;
                drop(state);
                return Err(self.reject(BreakerError::Open {
                    endpoint: inner.name.clone(),
                    retry_after: retry_at - now,
                }));
            }
            Phase::Open { .. } => (true, state.begin_probe(now)),
            Phase::HalfOpen { probing: false } => {
                state.phase = Phase::HalfOpen { probing: true };
                (true, None)
            }
            Phase::HalfOpen { probing: true } => {
                state.rejected_count += 1;
                drop(state);
                return Err(self.reject(BreakerError::ProbeInFlight {
                    endpoint: inner.name.clone(),
                }));
            }
        };
        drop(state);

        if let Some(transition) = transition {
            self.emit(transition);
        }
        if probe {
            debug!(endpoint = %inner.name, "Allowing recovery probe");
        }

        Ok(Permit {
            inner,
            probe,
            settled: false,
        })
    }

    /// Records the outcome of a call and applies any resulting state change.
    fn post_call(&self, mut permit: Permit<'_>, outcome: Outcome, duration: Duration) {
        permit.settled = true;
        let inner = &*self.inner;
        let now = inner.clock.now();
        let success = outcome == Outcome::Success;

        inner.metric_sink.record_call(&inner.name, success, duration);
        if outcome == Outcome::Timeout {
            inner.metric_sink.record_timeout(&inner.name);
        }

        let transition = {
            let mut state = inner.state.lock();
            let probing = permit.probe && matches!(state.phase, Phase::HalfOpen { .. });

            if success {
                state.success_count += 1;
                state.consecutive_failures = 0;
                inner.policy.record_success(now);

                if probing {
                    state.reset_closed(now)
                } else {
                    None
                }
            } else {
                if outcome == Outcome::Timeout {
                    state.timeout_count += 1;
                }
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_failure = Some(now);
                inner.policy.record_failure(now);

                if inner.passthrough {
                    None
                } else if probing
                    || (state.current() == State::Closed
                        && inner.policy.should_trip(state.consecutive_failures, now))
                {
                    state.trip_open(now, inner.config.recovery_timeout())
                } else {
                    None
                }
            }
        };

        if success {
            inner.hooks.execute_success_hook(&inner.name);
        } else {
            inner.hooks.execute_failure_hook(&inner.name);
        }

        if let Some(transition) = transition {
            self.emit(transition);
        }
    }

    fn reject<E>(&self, err: BreakerError<E>) -> BreakerError<E> {
        let inner = &*self.inner;
        debug!(
            endpoint = %inner.name,
            retry_after_ms = err.retry_after().map(|d| d.as_millis() as u64),
            "Circuit breaker rejecting call"
        );
        inner.metric_sink.record_rejection(&inner.name);
        inner.hooks.execute_rejected_hook(&inner.name);
        err
    }

    /// Logs, records and hooks a transition. Never called with the state lock held.
    fn emit(&self, transition: Transition) {
        let inner = &*self.inner;
        match (transition.from, transition.to) {
            (State::HalfOpen, State::Open) => warn!(
                endpoint = %inner.name,
                recovery_timeout_ms = inner.config.recovery_timeout_ms,
                "Recovery probe failed, reopening circuit"
            ),
            (_, State::Open) => info!(
                endpoint = %inner.name,
                from = %transition.from,
                recovery_timeout_ms = inner.config.recovery_timeout_ms,
                "Circuit breaker opening"
            ),
            (_, State::HalfOpen) => info!(
                endpoint = %inner.name,
                "Circuit breaker half-open, probing recovery"
            ),
            (_, State::Closed) => info!(
                endpoint = %inner.name,
                from = %transition.from,
                "Circuit breaker closed"
            ),
        }

        inner
            .metric_sink
            .record_state_transition(&inner.name, transition.from, transition.to);
        inner
            .hooks
            .execute_state_transition_hook(&inner.name, transition.to);
    }

    /// Forces the circuit breaker to the open state.
    pub fn force_open(&self) -> bool {
        let inner = &*self.inner;
        let transition = {
            let mut state = inner.state.lock();
            if state.current() == State::Open {
                return false;
            }
            state.trip_open(inner.clock.now(), inner.config.recovery_timeout())
        };

        match transition {
            Some(transition) => {
                self.emit(transition);
                true
            }
            None => false,
        }
    }

    /// Forces the circuit breaker to the closed state.
    pub fn force_closed(&self) -> bool {
        let inner = &*self.inner;
        let transition = {
            let mut state = inner.state.lock();
            if state.current() == State::Closed {
                return false;
            }
            inner.policy.reset();
            state.reset_closed(inner.clock.now())
        };

        match transition {
            Some(transition) => {
                self.emit(transition);
                true
            }
            None => false,
        }
    }

    /// Returns to closed and clears every counter.
    pub fn reset(&self) {
        let inner = &*self.inner;
        let transition = {
            let mut state = inner.state.lock();
            inner.policy.reset();
            state.reset(inner.clock.now())
        };

        if let Some(transition) = transition {
            self.emit(transition);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.current_state())
            .field("passthrough", &self.inner.passthrough)
            .finish()
    }
}

#[cfg(feature = "async")]
impl CircuitBreaker {
    /// Executes an async function wrapped by the circuit breaker.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self.pre_call()?;

        let start = Instant::now();
        let result = f().await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.post_call(permit, outcome, start.elapsed());

        result.map_err(BreakerError::Operation)
    }

    /// Executes an async function that must finish within `timeout`.
    ///
    /// An elapsed timeout counts as a failure and is reported as
    /// [`BreakerError::Timeout`].
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        f: F,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self.pre_call()?;

        let start = Instant::now();
        match tokio::time::timeout(timeout, f()).await {
            Ok(result) => {
                let outcome = if result.is_ok() {
                    Outcome::Success
                } else {
                    Outcome::Failure
                };
                self.post_call(permit, outcome, start.elapsed());
                result.map_err(BreakerError::Operation)
            }
            Err(_) => {
                self.post_call(permit, Outcome::Timeout, start.elapsed());
                debug!(
                    endpoint = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out"
                );
                Err(BreakerError::Timeout {
                    endpoint: self.inner.name.clone(),
                    timeout,
                })
            }
        }
    }
}
