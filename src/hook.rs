//! Hook registry for circuit breaker events.

use crate::state::State;
use parking_lot::RwLock;
use std::sync::Arc;

type HookFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// A registry for circuit breaker event hooks.
///
/// Every hook receives the name of the endpoint whose breaker fired it, so one
/// registry can be shared by all breakers of a [`BreakerRegistry`](crate::BreakerRegistry).
pub struct HookRegistry {
    on_open: RwLock<Option<HookFn>>,
    on_close: RwLock<Option<HookFn>>,
    on_half_open: RwLock<Option<HookFn>>,
    on_success: RwLock<Option<HookFn>>,
    on_failure: RwLock<Option<HookFn>>,
    on_rejected: RwLock<Option<HookFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_success: RwLock::new(None),
            on_failure: RwLock::new(None),
            on_rejected: RwLock::new(None),
        }
    }

    /// Sets the hook to call when a breaker opens.
    pub fn set_on_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a breaker closes.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a breaker half-opens.
    pub fn set_on_half_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a call succeeds.
    pub fn set_on_success<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_success.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a call fails.
    pub fn set_on_failure<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a breaker rejects a call.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    fn fire(slot: &RwLock<Option<HookFn>>, endpoint: &str) {
        // clone out so a hook may re-register hooks without deadlocking
        let hook = slot.read().clone();
        if let Some(hook) = hook {
            hook(endpoint);
        }
    }

    /// Executes the appropriate hook for a state transition.
    pub fn execute_state_transition_hook(&self, endpoint: &str, to: State) {
        match to {
            State::Open => Self::fire(&self.on_open, endpoint),
            State::Closed => Self::fire(&self.on_close, endpoint),
            State::HalfOpen => Self::fire(&self.on_half_open, endpoint),
        }
    }

    /// Executes the success hook.
    pub fn execute_success_hook(&self, endpoint: &str) {
        Self::fire(&self.on_success, endpoint);
    }

    /// Executes the failure hook.
    pub fn execute_failure_hook(&self, endpoint: &str) {
        Self::fire(&self.on_failure, endpoint);
    }

    /// Executes the rejection hook.
    pub fn execute_rejected_hook(&self, endpoint: &str) {
        Self::fire(&self.on_rejected, endpoint);
    }
}
