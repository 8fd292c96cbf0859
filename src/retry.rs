//! Retry with exponential backoff and jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryPolicy;

/// Largest fraction by which jitter inflates a delay.
pub const MAX_JITTER: f64 = 0.1;

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`, counting attempts from 0.
    ///
    /// `min(base_delay * multiplier^attempt, max_delay)`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Applies jitter to `delay` when enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        delay.mul_f64(1.0 + factor)
    }
}

#[cfg(feature = "async")]
pub use self::executor::{Retrier, RetrySnapshot};

#[cfg(feature = "async")]
mod executor {
    use std::fmt::Display;
    use std::future::Future;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{debug, warn};

    use crate::config::RetryPolicy;

    #[derive(Debug, Default)]
    struct RetryStats {
        calls: AtomicU64,
        attempts: AtomicU64,
        retries: AtomicU64,
        exhausted: AtomicU64,
    }

    /// Cumulative counters of a [`Retrier`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RetrySnapshot {
        /// Operations handed to the retrier.
        pub calls: u64,
        /// Individual invocations, first attempts included.
        pub attempts: u64,
        /// Invocations that followed a backoff.
        pub retries: u64,
        /// Operations that failed with their retry budget spent.
        pub exhausted: u64,
    }

    /// Reattempts fallible async operations with exponential backoff.
    ///
    /// The retrier knows nothing about circuit breakers; compose it around a
    /// breaker-guarded call and pass a predicate that refuses rejections.
    #[derive(Debug, Default)]
    pub struct Retrier {
        policy: RetryPolicy,
        stats: RetryStats,
    }

    impl Retrier {
        /// Creates a retrier with `policy` as its default.
        pub fn new(policy: RetryPolicy) -> Self {
            Self {
                policy,
                stats: RetryStats::default(),
            }
        }

        /// The default policy.
        pub fn policy(&self) -> &RetryPolicy {
            &self.policy
        }

        /// Runs `op`, retrying every failure.
        pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
        where
            F: FnMut() -> Fut,
            Fut: Future<Output = Result<T, E>>,
            E: Display,
        {
            self.execute_with_policy(&self.policy, op, |_| true).await
        }

        /// Runs `op`, retrying only failures `should_retry` accepts.
        pub async fn execute_with_predicate<F, Fut, T, E, P>(
            &self,
            op: F,
            should_retry: P,
        ) -> Result<T, E>
        where
            F: FnMut() -> Fut,
            Fut: Future<Output = Result<T, E>>,
            E: Display,
            P: Fn(&E) -> bool,
        {
            self.execute_with_policy(&self.policy, op, should_retry)
                .await
        }

        /// Runs `op` under an explicit policy instead of the default one.
        ///
        /// The last error is returned unchanged once `policy.max_retries`
        /// retries have failed; no delay follows the final attempt.
        pub async fn execute_with_policy<F, Fut, T, E, P>(
            &self,
            policy: &RetryPolicy,
            mut op: F,
            should_retry: P,
        ) -> Result<T, E>
        where
            F: FnMut() -> Fut,
            Fut: Future<Output = Result<T, E>>,
            E: Display,
            P: Fn(&E) -> bool,
        {
            self.stats.calls.fetch_add(1, Ordering::Relaxed);
            let mut attempt: u32 = 0;

            loop {
                self.stats.attempts.fetch_add(1, Ordering::Relaxed);

                match op().await {
                    Ok(value) => {
                        if attempt > 0 {
                            debug!(attempts = attempt + 1, "Operation succeeded after retries");
                        }
                        return Ok(value);
                    }
                    Err(err) => {
                        if !should_retry(&err) {
                            debug!(attempt = attempt + 1, error = %err, "Error not retryable");
                            return Err(err);
                        }

                        if attempt >= policy.max_retries {
                            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                attempts = attempt + 1,
                                max_retries = policy.max_retries,
                                error = %err,
                                "Operation failed after max retries"
                            );
                            return Err(err);
                        }

                        let delay = policy.jittered(policy.delay_for(attempt));
                        debug!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Operation failed, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;

                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        attempt += 1;
                    }
                }
            }
        }

        /// Cumulative counters since creation or the last reset.
        pub fn stats(&self) -> RetrySnapshot {
            RetrySnapshot {
                calls: self.stats.calls.load(Ordering::Relaxed),
                attempts: self.stats.attempts.load(Ordering::Relaxed),
                retries: self.stats.retries.load(Ordering::Relaxed),
                exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            }
        }

        /// Zeroes the counters.
        pub fn reset(&self) {
            self.stats.calls.store(0, Ordering::Relaxed);
            self.stats.attempts.store(0, Ordering::Relaxed);
            self.stats.retries.store(0, Ordering::Relaxed);
            self.stats.exhausted.store(0, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;
        use std::time::Duration;

        fn policy(max_retries: u32) -> RetryPolicy {
            RetryPolicy {
                max_retries,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                backoff_multiplier: 2.0,
                jitter: false,
            }
        }

        #[tokio::test(start_paused = true)]
        async fn succeeds_after_two_failures() {
            let retrier = Retrier::new(policy(2));
            let attempts = Arc::new(AtomicU32::new(0));

            let result = retrier
                .execute(|| {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("proxy unavailable".to_string())
                        } else {
                            Ok("story list")
                        }
                    }
                })
                .await;

            assert_eq!(result, Ok("story list"));
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
            assert_eq!(
                retrier.stats(),
                RetrySnapshot {
                    calls: 1,
                    attempts: 3,
                    retries: 2,
                    exhausted: 0,
                }
            );
        }

        #[tokio::test(start_paused = true)]
        async fn always_failing_gives_up_with_last_error() {
            let retrier = Retrier::new(policy(2));
            let attempts = Arc::new(AtomicU32::new(0));

            let result: Result<(), String> = retrier
                .execute(|| {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        Err(format!("failure #{n}"))
                    }
                })
                .await;

            assert_eq!(result, Err("failure #2".to_string()));
            assert_eq!(attempts.load(Ordering::SeqCst), 3);
            assert_eq!(retrier.stats().exhausted, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn predicate_stops_retries() {
            let retrier = Retrier::new(policy(5));
            let attempts = Arc::new(AtomicU32::new(0));

            let result: Result<(), &str> = retrier
                .execute_with_predicate(
                    || {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err("permanent")
                        }
                    },
                    |e| *e != "permanent",
                )
                .await;

            assert!(result.is_err());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
            assert_eq!(retrier.stats().exhausted, 0);
        }

        #[tokio::test(start_paused = true)]
        async fn backoff_doubles_between_attempts() {
            let retrier = Retrier::new(policy(3));
            let start = tokio::time::Instant::now();

            let _: Result<(), &str> = retrier.execute(|| async { Err("down") }).await;

            // 100 + 200 + 400, nothing after the final attempt
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
            assert!(elapsed < Duration::from_millis(750), "{elapsed:?}");
        }

        #[tokio::test(start_paused = true)]
        async fn zero_retries_runs_once() {
            let retrier = Retrier::new(policy(0));
            let attempts = Arc::new(AtomicU32::new(0));

            let _: Result<(), &str> = retrier
                .execute(|| {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("down")
                    }
                })
                .await;

            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn reset_clears_counters() {
            let retrier = Retrier::new(policy(1));
            let _: Result<(), &str> = retrier.execute(|| async { Err("down") }).await;
            assert_ne!(retrier.stats(), RetrySnapshot::default());

            retrier.reset();
            assert_eq!(retrier.stats(), RetrySnapshot::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        let delays: Vec<u64> = (0..6)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn jitter_disabled_is_identity() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(
            policy.jittered(Duration::from_millis(1_234)),
            Duration::from_millis(1_234)
        );
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_max(
            base in 0u64..5_000,
            extra in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let policy = RetryPolicy {
                max_retries: 3,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                backoff_multiplier: multiplier,
                jitter: false,
            };
            let delay = policy.delay_for(attempt);
            prop_assert!(delay <= policy.max_delay());
            prop_assert!(delay >= policy.delay_for(attempt.saturating_sub(1)));
        }

        #[test]
        fn jitter_inflates_by_at_most_ten_percent(millis in 0u64..100_000) {
            let policy = RetryPolicy::default();
            let delay = Duration::from_millis(millis);
            let jittered = policy.jittered(delay);
            prop_assert!(jittered >= delay);
            prop_assert!(jittered <= delay.mul_f64(1.0 + MAX_JITTER) + Duration::from_nanos(1));
        }
    }
}
