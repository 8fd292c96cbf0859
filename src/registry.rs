//! Registry of breakers keyed by endpoint name.

use ahash::RandomState;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{
    ceil_millis, BreakerConfig, EndpointOverrides, ResilienceConfig, RetryPolicy,
};
use crate::hook::HookRegistry;
use crate::metrics::{BreakerSnapshot, MetricSink, NullMetricSink};

#[cfg(feature = "async")]
use crate::error::{BreakerError, BreakerResult};
#[cfg(feature = "async")]
use crate::retry::Retrier;
#[cfg(feature = "async")]
use std::future::Future;
#[cfg(feature = "async")]
use tracing::debug;

struct RegistryInner {
    breakers: RwLock<HashMap<String, CircuitBreaker, RandomState>>,
    defaults: BreakerConfig,
    overrides: HashMap<String, EndpointOverrides>,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
    passthrough: bool,
    #[cfg(feature = "async")]
    retrier: Retrier,
}

/// Shared lookup of circuit breakers by endpoint name.
///
/// Call sites that use the same name share one breaker and therefore one
/// failure count. Construct one registry and hand clones of it to every call
/// site; clones share the same breakers.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    /// Creates a registry with default breaker and retry settings.
    pub fn new() -> Self {
        RegistryBuilder::new().build()
    }

    /// Creates a builder for customizing a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Creates a registry from a configuration document.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        RegistryBuilder::from_config(config).build()
    }

    /// Returns the breaker for `endpoint`, creating it on first use.
    pub fn breaker(&self, endpoint: &str) -> CircuitBreaker {
        if let Some(breaker) = self.inner.breakers.read().get(endpoint) {
            return breaker.clone();
        }

        let mut breakers = self.inner.breakers.write();
        breakers
            .entry(endpoint.to_owned())
            .or_insert_with(|| self.create(endpoint))
            .clone()
    }

    fn create(&self, endpoint: &str) -> CircuitBreaker {
        let inner = &*self.inner;
        let config = match inner.overrides.get(endpoint) {
            Some(overrides) => inner.defaults.with_overrides(overrides),
            None => inner.defaults.clone(),
        };

        CircuitBreaker::builder(endpoint)
            .config(config)
            .shared_clock(Arc::clone(&inner.clock))
            .shared_metric_sink(Arc::clone(&inner.metric_sink))
            .shared_hooks(Arc::clone(&inner.hooks))
            .passthrough(inner.passthrough)
            .build()
    }

    /// Returns the breaker for `endpoint` if one was already created.
    pub fn get(&self, endpoint: &str) -> Option<CircuitBreaker> {
        self.inner.breakers.read().get(endpoint).cloned()
    }

    /// Names of all breakers created so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.inner.breakers.read().len()
    }

    /// True when no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.inner.breakers.read().is_empty()
    }

    /// Statistics of every breaker, keyed by endpoint name.
    pub fn stats(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.inner
            .breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Statistics of one breaker, if it exists.
    pub fn stats_for(&self, endpoint: &str) -> Option<BreakerSnapshot> {
        self.get(endpoint).map(|breaker| breaker.snapshot())
    }

    /// Drops every breaker and clears the retry counters.
    ///
    /// Handles obtained before the reset keep working but are no longer
    /// reachable through the registry.
    pub fn reset_all(&self) {
        let dropped = {
            let mut breakers = self.inner.breakers.write();
            let count = breakers.len();
            breakers.clear();
            count
        };
        #[cfg(feature = "async")]
        self.inner.retrier.reset();

        info!(breakers = dropped, "Breaker registry reset");
    }
}

#[cfg(feature = "async")]
impl BreakerRegistry {
    /// The retry helper used by [`call`](Self::call).
    pub fn retrier(&self) -> &Retrier {
        &self.inner.retrier
    }

    /// Runs `op` through the breaker for `endpoint`, retrying with the
    /// registry's default policy.
    ///
    /// Each failed attempt counts against the breaker. Rejections from the
    /// breaker end the retry loop immediately.
    pub async fn call<F, Fut, T, E>(&self, endpoint: &str, op: F) -> BreakerResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.call_with_policy(endpoint, self.inner.retrier.policy(), op)
            .await
    }

    /// Like [`call`](Self::call), with a per-call retry policy.
    pub async fn call_with_policy<F, Fut, T, E>(
        &self,
        endpoint: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> BreakerResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.breaker(endpoint);
        let breaker = &breaker;
        let op = &op;

        debug!(endpoint, max_retries = policy.max_retries, "Guarded call");
        self.inner
            .retrier
            .execute_with_policy(policy, || breaker.call_async(op), BreakerError::is_retryable)
            .await
    }

    /// Like [`call`](Self::call), bounding every attempt by `timeout`.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        endpoint: &str,
        timeout: Duration,
        op: F,
    ) -> BreakerResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.breaker(endpoint);
        let breaker = &breaker;
        let op = &op;

        self.inner
            .retrier
            .execute_with_policy(
                self.inner.retrier.policy(),
                || breaker.call_with_timeout(timeout, op),
                BreakerError::is_retryable,
            )
            .await
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.names())
            .field("defaults", &self.inner.defaults)
            .field("passthrough", &self.inner.passthrough)
            .finish()
    }
}

/// Builder for [`BreakerRegistry`].
pub struct RegistryBuilder {
    defaults: BreakerConfig,
    overrides: HashMap<String, EndpointOverrides>,
    #[cfg_attr(not(feature = "async"), allow(dead_code))]
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
    passthrough: bool,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            defaults: BreakerConfig::default(),
            overrides: HashMap::new(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            metric_sink: Arc::new(NullMetricSink),
            hooks: Arc::new(HookRegistry::new()),
            passthrough: false,
        }
    }

    /// Starts from a configuration document.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            defaults: config.breaker.clone(),
            overrides: config.endpoints.clone(),
            retry: config.retry.clone(),
            passthrough: config.passthrough,
            ..Self::new()
        }
    }

    /// Sets the settings every new breaker starts from.
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.defaults = config;
        self
    }

    /// Sets the default failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.defaults.failure_threshold = threshold;
        self
    }

    /// Sets the default recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.recovery_timeout_ms = ceil_millis(timeout);
        self
    }

    /// Overrides settings for one endpoint.
    pub fn endpoint(mut self, name: impl Into<String>, overrides: EndpointOverrides) -> Self {
        self.overrides.insert(name.into(), overrides);
        self
    }

    /// Sets the default retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the time source shared by all breakers.
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the metric sink shared by all breakers.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Sets the hooks shared by all breakers.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Makes every breaker a passthrough that never rejects.
    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Builds the registry. No breaker exists until first referenced.
    pub fn build(self) -> BreakerRegistry {
        BreakerRegistry {
            inner: Arc::new(RegistryInner {
                breakers: RwLock::new(HashMap::with_hasher(RandomState::new())),
                defaults: self.defaults,
                overrides: self.overrides,
                clock: self.clock,
                metric_sink: self.metric_sink,
                hooks: self.hooks,
                passthrough: self.passthrough,
                #[cfg(feature = "async")]
                retrier: Retrier::new(self.retry),
            }),
        }
    }
}
