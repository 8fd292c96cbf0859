//! Circuit breaker state machine implementation.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed,

    /// Circuit is open and operations are rejected.
    Open,

    /// Circuit is letting a single probe through to test recovery.
    HalfOpen,
}

impl State {
    /// Lowercase label used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal phase. `Open` always carries the instant after which a probe may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Closed,
    Open { retry_at: Instant },
    HalfOpen { probing: bool },
}

impl Phase {
    pub(crate) fn state(self) -> State {
        match self {
            Phase::Closed => State::Closed,
            Phase::Open { .. } => State::Open,
            Phase::HalfOpen { .. } => State::HalfOpen,
        }
    }
}

/// A state change produced while the lock was held, emitted after release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) from: State,
    pub(crate) to: State,
}

/// Mutable record of one breaker. Always accessed under the breaker's mutex.
#[derive(Debug)]
pub(crate) struct StateManager {
    pub(crate) phase: Phase,
    pub(crate) consecutive_failures: u32,
    pub(crate) success_count: u64,
    pub(crate) timeout_count: u64,
    pub(crate) rejected_count: u64,
    pub(crate) last_failure: Option<Instant>,
    pub(crate) last_transition: Instant,
}

impl StateManager {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            success_count: 0,
            timeout_count: 0,
            rejected_count: 0,
            last_failure: None,
            last_transition: now,
        }
    }

    pub(crate) fn current(&self) -> State {
        self.phase.state()
    }

    /// Instant after which a probe is allowed, if the circuit is open.
    pub(crate) fn retry_at(&self) -> Option<Instant> {
        match self.phase {
            Phase::Open { retry_at } => Some(retry_at),
            _ => None,
        }
    }

    fn move_to(&mut self, phase: Phase, now: Instant) -> Option<Transition> {
        let from = self.phase.state();
        self.phase = phase;
        self.last_transition = now;
        let to = phase.state();
        (from != to).then_some(Transition { from, to })
    }

    /// Opens the circuit until `now + recovery`.
    pub(crate) fn trip_open(&mut self, now: Instant, recovery: Duration) -> Option<Transition> {
        self.move_to(
            Phase::Open {
                retry_at: now + recovery,
            },
            now,
        )
    }

    /// Open -> HalfOpen with the probe slot taken by the caller.
    pub(crate) fn begin_probe(&mut self, now: Instant) -> Option<Transition> {
        self.move_to(Phase::HalfOpen { probing: true }, now)
    }

    pub(crate) fn reset_closed(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.move_to(Phase::Closed, now)
    }

    /// Frees the probe slot of an abandoned probe so the next caller can probe.
    pub(crate) fn release_probe(&mut self) {
        if let Phase::HalfOpen { probing: true } = self.phase {
            self.phase = Phase::HalfOpen { probing: false };
        }
    }

    /// Clears counters and returns to closed.
    pub(crate) fn reset(&mut self, now: Instant) -> Option<Transition> {
        self.success_count = 0;
        self.timeout_count = 0;
        self.rejected_count = 0;
        self.last_failure = None;
        self.reset_closed(now)
    }
}
