//! # fetchguard
//!
//! Failure isolation for outbound fetches: per-endpoint circuit breakers, a
//! retry-with-backoff helper, and a registry that lets independent call sites
//! share one breaker per logical endpoint name.
//!
//! ## Circuit breaker states
//!
//! - **Closed**: calls pass through. Consecutive failures are counted and any
//!   success resets the count. Reaching the failure threshold opens the circuit.
//! - **Open**: calls are rejected immediately with [`BreakerError::Open`], which
//!   carries the remaining wait, until the recovery timeout has elapsed.
//! - **Half-Open**: exactly one probe call runs. Success closes the circuit,
//!   failure reopens it for another recovery timeout.
//!
//! ## Basic Usage
//!
//! ```rust
//! use fetchguard::{BreakerError, CircuitBreaker, State};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct FetchError(u16);
//!
//! impl std::fmt::Display for FetchError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "upstream returned {}", self.0)
//!     }
//! }
//!
//! let breaker = CircuitBreaker::builder("item-fetch")
//!     .failure_threshold(2)
//!     .recovery_timeout(Duration::from_secs(30))
//!     .build();
//!
//! for _ in 0..2 {
//!     let result: Result<(), _> = breaker.call(|| Err(FetchError(503)));
//!     assert!(matches!(result, Err(BreakerError::Operation(_))));
//! }
//! assert_eq!(breaker.current_state(), State::Open);
//!
//! match breaker.call(|| Ok::<_, FetchError>("never runs")) {
//!     Err(BreakerError::Open { retry_after, .. }) => assert!(retry_after <= Duration::from_secs(30)),
//!     other => panic!("expected a rejection, got {other:?}"),
//! }
//! ```
//!
//! ## Registry and retries
//!
//! With the `async` feature (on by default), a [`BreakerRegistry`] runs an
//! operation through the named breaker inside the retry helper. Failures count
//! against the breaker; once it opens, the retry loop stops and the rejection
//! is returned.
//!
//! ```rust,ignore
//! let registry = BreakerRegistry::new();
//! let story_ids = registry
//!     .call("story-list-fetch", || async { fetch_top_stories().await })
//!     .await?;
//! ```
//!
//! ## Features
//!
//! - `async` - Async calls, timeouts, and the retry helper (tokio)
//! - `prometheus` - Prometheus metric sink

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod clock;
mod config;
mod error;
mod hook;
mod metrics;
mod policy;
pub mod prelude;
mod registry;
mod retry;
mod state;

// Re-exports
pub use breaker::CircuitBreaker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerBuilder, BreakerConfig, EndpointOverrides, ResilienceConfig, RetryPolicy};
pub use error::{BreakerError, BreakerResult, ConfigError};
pub use hook::HookRegistry;
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{BreakerSnapshot, MetricSink, NullMetricSink};
pub use policy::{ConsecutiveFailures, TripPolicy, WindowedFailures};
pub use registry::{BreakerRegistry, RegistryBuilder};
#[cfg(feature = "async")]
pub use retry::{Retrier, RetrySnapshot};
pub use retry::MAX_JITTER;
pub use state::State;
