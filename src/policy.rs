//! Policy engine for circuit breaker trip decisions.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Decides when a closed circuit should open.
///
/// The breaker calls the `record_*` methods under its state lock, followed by
/// `should_trip` after a failure while closed.
pub trait TripPolicy: Send + Sync + 'static {
    /// Determines if the circuit should trip open.
    fn should_trip(&self, consecutive_failures: u32, now: Instant) -> bool;

    /// Observes a failed call.
    fn record_failure(&self, _now: Instant) {}

    /// Observes a successful call.
    fn record_success(&self, _now: Instant) {}

    /// Forgets anything observed so far.
    fn reset(&self) {}
}

/// Trips once the consecutive failure count reaches a fixed threshold.
///
/// Failures accumulate until a success or a reset, however far apart they are.
#[derive(Debug, Clone, Copy)]
pub struct ConsecutiveFailures {
    threshold: u32,
}

impl ConsecutiveFailures {
    /// Creates a new fixed-count policy.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }
}

impl TripPolicy for ConsecutiveFailures {
    fn should_trip(&self, consecutive_failures: u32, _now: Instant) -> bool {
        consecutive_failures >= self.threshold
    }
}

/// Trips when `threshold` consecutive failures all happened within `window`.
pub struct WindowedFailures {
    threshold: u32,
    window: Duration,
    failures: Mutex<SmallVec<[Instant; 16]>>,
}

impl WindowedFailures {
    /// Creates a new time-windowed policy.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            failures: Mutex::new(SmallVec::new()),
        }
    }

    fn evict(&self, failures: &mut SmallVec<[Instant; 16]>, now: Instant) {
        let stale = failures
            .iter()
            .take_while(|at| now.duration_since(**at) > self.window)
            .count();
        failures.drain(..stale);
    }
}

impl TripPolicy for WindowedFailures {
    fn should_trip(&self, _consecutive_failures: u32, now: Instant) -> bool {
        let mut failures = self.failures.lock();
        self.evict(&mut failures, now);
        failures.len() as u32 >= self.threshold
    }

    fn record_failure(&self, now: Instant) {
        let mut failures = self.failures.lock();
        self.evict(&mut failures, now);
        failures.push(now);
    }

    fn record_success(&self, _now: Instant) {
        self.failures.lock().clear();
    }

    fn reset(&self) {
        self.failures.lock().clear();
    }
}
