//! Re-exports the types most call sites need.
//!
//! # Example
//! ```rust,no_run
//! use fetchguard::prelude::*;
//!
//! let registry = BreakerRegistry::new();
//! let breaker = registry.breaker("item-fetch");
//! assert_eq!(breaker.current_state(), State::Closed);
//! ```

pub use crate::{
    BreakerConfig, BreakerError, BreakerRegistry, BreakerResult, CircuitBreaker, RetryPolicy,
    State,
};

#[cfg(feature = "async")]
pub use crate::Retrier;
