//! Metric sinks and breaker statistics.

use std::time::{Duration, Instant};

use crate::state::State;

/// Trait for metrics sinks that can receive circuit breaker events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition event.
    fn record_state_transition(&self, endpoint: &str, from: State, to: State);

    /// Records a call that reached the guarded operation.
    fn record_call(&self, endpoint: &str, success: bool, duration: Duration);

    /// Records a call rejected by the breaker.
    fn record_rejection(&self, endpoint: &str);

    /// Records a call abandoned by its timeout.
    fn record_timeout(&self, endpoint: &str);
}

/// A null metrics sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _endpoint: &str, _from: State, _to: State) {}
    fn record_call(&self, _endpoint: &str, _success: bool, _duration: Duration) {}
    fn record_rejection(&self, _endpoint: &str) {}
    fn record_timeout(&self, _endpoint: &str) {}
}

/// Point-in-time statistics of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: State,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Successful calls since creation or reset.
    pub success_count: u64,
    /// Calls that timed out since creation or reset.
    pub timeout_count: u64,
    /// Calls rejected without running since creation or reset.
    pub rejected_count: u64,
    /// When the last failure was recorded.
    pub last_failure: Option<Instant>,
    /// Instant after which a probe is allowed. Set only while open.
    pub next_attempt: Option<Instant>,
    /// Remaining wait until `next_attempt`, measured when the snapshot was taken.
    pub retry_after: Option<Duration>,
}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus {
    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    use super::MetricSink;
    use crate::state::State;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct EndpointLabels {
        endpoint: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        endpoint: String,
        outcome: &'static str,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        endpoint: String,
        from: &'static str,
        to: &'static str,
    }

    fn duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.005, 2.0, 12))
    }

    /// Metric sink that feeds a `prometheus-client` registry.
    #[derive(Clone)]
    pub struct PrometheusSink {
        calls: Family<CallLabels, Counter>,
        durations: Family<EndpointLabels, Histogram, fn() -> Histogram>,
        rejections: Family<EndpointLabels, Counter>,
        timeouts: Family<EndpointLabels, Counter>,
        transitions: Family<TransitionLabels, Counter>,
    }

    impl PrometheusSink {
        /// Creates the metric families and registers them with `registry`.
        pub fn register(registry: &mut Registry) -> Self {
            let sink = Self {
                calls: Family::default(),
                durations: Family::new_with_constructor(duration_histogram as fn() -> Histogram),
                rejections: Family::default(),
                timeouts: Family::default(),
                transitions: Family::default(),
            };

            registry.register(
                "fetchguard_calls",
                "Calls that reached the guarded operation",
                sink.calls.clone(),
            );
            registry.register(
                "fetchguard_call_duration_seconds",
                "Duration of guarded calls",
                sink.durations.clone(),
            );
            registry.register(
                "fetchguard_rejections",
                "Calls rejected by an open breaker",
                sink.rejections.clone(),
            );
            registry.register(
                "fetchguard_timeouts",
                "Calls abandoned by their timeout",
                sink.timeouts.clone(),
            );
            registry.register(
                "fetchguard_transitions",
                "Breaker state transitions",
                sink.transitions.clone(),
            );

            sink
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, endpoint: &str, from: State, to: State) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    endpoint: endpoint.to_owned(),
                    from: from.as_str(),
                    to: to.as_str(),
                })
                .inc();
        }

        fn record_call(&self, endpoint: &str, success: bool, duration: Duration) {
            self.calls
                .get_or_create(&CallLabels {
                    endpoint: endpoint.to_owned(),
                    outcome: if success { "success" } else { "failure" },
                })
                .inc();
            self.durations
                .get_or_create(&EndpointLabels {
                    endpoint: endpoint.to_owned(),
                })
                .observe(duration.as_secs_f64());
        }

        fn record_rejection(&self, endpoint: &str) {
            self.rejections
                .get_or_create(&EndpointLabels {
                    endpoint: endpoint.to_owned(),
                })
                .inc();
        }

        fn record_timeout(&self, endpoint: &str) {
            self.timeouts
                .get_or_create(&EndpointLabels {
                    endpoint: endpoint.to_owned(),
                })
                .inc();
        }
    }

}
