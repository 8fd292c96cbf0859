//! Configuration for breakers, retries, and registries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{ConsecutiveFailures, TripPolicy, WindowedFailures};

/// Per-breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed, in milliseconds.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Observation period in milliseconds. Only enforced when `windowed` is set.
    #[serde(default = "default_monitoring_period_ms")]
    pub monitoring_period_ms: u64,

    /// Count only failures that fall inside the monitoring period.
    #[serde(default)]
    pub windowed: bool,
}

/// Whole milliseconds covering `duration`, rounded up and saturating.
pub(crate) fn ceil_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_monitoring_period_ms() -> u64 {
    10_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            monitoring_period_ms: default_monitoring_period_ms(),
            windowed: false,
        }
    }
}

impl BreakerConfig {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Monitoring period as a [`Duration`].
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    /// Builds the trip policy these settings describe.
    pub fn trip_policy(&self) -> Arc<dyn TripPolicy> {
        if self.windowed {
            Arc::new(WindowedFailures::new(
                self.failure_threshold,
                self.monitoring_period(),
            ))
        } else {
            Arc::new(ConsecutiveFailures::new(self.failure_threshold))
        }
    }

    /// Returns a copy with the set fields of `overrides` applied.
    pub fn with_overrides(&self, overrides: &EndpointOverrides) -> Self {
        Self {
            failure_threshold: overrides
                .failure_threshold
                .unwrap_or(self.failure_threshold),
            recovery_timeout_ms: overrides
                .recovery_timeout_ms
                .unwrap_or(self.recovery_timeout_ms),
            monitoring_period_ms: overrides
                .monitoring_period_ms
                .unwrap_or(self.monitoring_period_ms),
            windowed: overrides.windowed.unwrap_or(self.windowed),
        }
    }

    /// Checks that the breaker can actually trip.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker.failure_threshold".into(),
                reason: "must be at least 1",
            });
        }
        if self.windowed && self.monitoring_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker.monitoring_period_ms".into(),
                reason: "must be positive when windowed",
            });
        }
        Ok(())
    }
}

/// Breaker settings that replace the defaults for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointOverrides {
    /// Replaces [`BreakerConfig::failure_threshold`].
    pub failure_threshold: Option<u32>,
    /// Replaces [`BreakerConfig::recovery_timeout_ms`].
    pub recovery_timeout_ms: Option<u64>,
    /// Replaces [`BreakerConfig::monitoring_period_ms`].
    pub monitoring_period_ms: Option<u64>,
    /// Replaces [`BreakerConfig::windowed`].
    pub windowed: Option<bool>,
}

/// Retry-with-backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Inflate each delay by up to 10% at random.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Max delay as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Checks that the backoff grows and stays bounded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "retry.backoff_multiplier".into(),
                reason: "must be a finite number >= 1.0",
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms".into(),
                reason: "must not exceed max_delay_ms",
            });
        }
        Ok(())
    }
}

/// Top-level configuration document for a registry.
///
/// ```toml
/// [breaker]
/// failure_threshold = 5
/// recovery_timeout_ms = 30000
///
/// [retry]
/// max_retries = 2
///
/// [endpoints.story-list-fetch]
/// failure_threshold = 3
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Defaults for every breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry policy used by registry calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-endpoint breaker overrides, keyed by endpoint name.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointOverrides>,

    /// Build breakers that never reject.
    #[serde(default)]
    pub passthrough: bool,
}

impl ResilienceConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Validates the defaults, the retry policy, and every resolved override.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.retry.validate()?;
        for (name, overrides) in &self.endpoints {
            self.breaker
                .with_overrides(overrides)
                .validate()
                .map_err(|err| match err {
                    ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                        field: field.replacen("breaker", &format!("endpoints.{name}"), 1),
                        reason,
                    },
                    other => other,
                })?;
        }
        Ok(())
    }

    /// Breaker settings for `endpoint`, overrides applied.
    pub fn breaker_for(&self, endpoint: &str) -> BreakerConfig {
        match self.endpoints.get(endpoint) {
            Some(overrides) => self.breaker.with_overrides(overrides),
            None => self.breaker.clone(),
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    name: String,
    config: BreakerConfig,
    policy: Option<Arc<dyn TripPolicy>>,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
    passthrough: bool,
}

impl BreakerBuilder {
    /// Creates a builder for the breaker guarding `name`, with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            policy: None,
            clock: Arc::new(SystemClock),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
            passthrough: false,
        }
    }

    /// Replaces all breaker settings at once.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of consecutive failures that opens the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Sets how long the circuit stays open before a probe is allowed.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout_ms = ceil_millis(timeout);
        self
    }

    /// Sets the monitoring period.
    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.config.monitoring_period_ms = ceil_millis(period);
        self
    }

    /// Sets a custom trip policy, overriding the one derived from the config.
    pub fn policy<P: TripPolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Sets the time source.
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    pub(crate) fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Sets a hook registry for the circuit breaker.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    pub(crate) fn shared_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hook_registry = hooks;
        self
    }

    /// Builds a breaker that never rejects or changes state, but still counts.
    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Builds a new circuit breaker with the configured settings.
    pub fn build(self) -> CircuitBreaker {
        let policy = self.policy.unwrap_or_else(|| self.config.trip_policy());
        CircuitBreaker::new(
            self.name,
            self.config,
            policy,
            self.clock,
            self.metric_sink,
            self.hook_registry,
            self.passthrough,
        )
    }
}
