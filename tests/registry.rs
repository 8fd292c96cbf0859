#![cfg(feature = "async")]

use fetchguard::{
    BreakerError, BreakerRegistry, EndpointOverrides, ManualClock, ResilienceConfig, RetryPolicy,
    State,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn registry(threshold: u32, max_retries: u32) -> BreakerRegistry {
    BreakerRegistry::builder()
        .failure_threshold(threshold)
        .recovery_timeout(Duration::from_secs(30))
        .retry_policy(quick_retries(max_retries))
        .clock(ManualClock::new())
        .build()
}

#[test]
fn test_same_name_shares_one_breaker() {
    let registry = registry(3, 0);
    let first = registry.breaker("item-fetch");
    let second = registry.breaker("item-fetch");

    let _ = first.call(|| Err::<(), _>("502"));
    let _ = first.call(|| Err::<(), _>("502"));
    assert_eq!(second.failure_count(), 2);

    let _ = second.call(|| Err::<(), _>("502"));
    assert_eq!(first.current_state(), State::Open);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_distinct_names_are_independent() {
    let registry = registry(2, 0);
    let items = registry.breaker("item-fetch");
    let proxy = registry.breaker("proxy-service-1");

    let _ = proxy.call(|| Err::<(), _>("cors failure"));
    let _ = proxy.call(|| Err::<(), _>("cors failure"));
    let _ = items.call(|| Ok::<_, &str>(()));

    let stats = registry.stats();
    assert_eq!(
        stats.keys().collect::<Vec<_>>(),
        vec!["item-fetch", "proxy-service-1"]
    );
    assert_eq!(stats["proxy-service-1"].state, State::Open);
    assert_eq!(stats["proxy-service-1"].failure_count, 2);
    assert_eq!(stats["item-fetch"].state, State::Closed);
    assert_eq!(stats["item-fetch"].failure_count, 0);
    assert_eq!(stats["item-fetch"].success_count, 1);
}

#[test]
fn test_breakers_are_created_lazily() {
    let registry = registry(2, 0);
    assert!(registry.is_empty());
    assert!(registry.get("story-list-fetch").is_none());
    assert!(registry.stats_for("story-list-fetch").is_none());

    registry.breaker("story-list-fetch");
    assert_eq!(registry.names(), vec!["story-list-fetch".to_string()]);
    assert_eq!(
        registry.stats_for("story-list-fetch").map(|s| s.state),
        Some(State::Closed)
    );
}

#[test]
fn test_endpoint_overrides_apply_at_creation() {
    let config = ResilienceConfig::from_toml_str(
        r#"
        [breaker]
        failure_threshold = 5

        [endpoints.proxy-service-3]
        failure_threshold = 1
        recovery_timeout_ms = 2000
        "#,
    )
    .expect("valid config");
    let registry = BreakerRegistry::from_config(&config);

    assert_eq!(registry.breaker("item-fetch").config().failure_threshold, 5);

    let proxy = registry.breaker("proxy-service-3");
    assert_eq!(proxy.config().failure_threshold, 1);
    assert_eq!(proxy.config().recovery_timeout(), Duration::from_secs(2));

    let built = BreakerRegistry::builder()
        .endpoint(
            "story-list-fetch",
            EndpointOverrides {
                failure_threshold: Some(7),
                ..Default::default()
            },
        )
        .build();
    assert_eq!(
        built.breaker("story-list-fetch").config().failure_threshold,
        7
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_once_breaker_opens() {
    let registry = registry(3, 5);
    let invoked = Arc::new(AtomicU32::new(0));

    let result = registry
        .call("story-list-fetch", || {
            let invoked = Arc::clone(&invoked);
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("proxy timeout")
            }
        })
        .await;

    assert!(matches!(result, Err(BreakerError::Open { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    let retries = registry.retrier().stats();
    assert_eq!(retries.attempts, 4);
    assert_eq!(retries.exhausted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_probe_in_flight_is_not_retried() {
    let clock = ManualClock::new();
    let registry = BreakerRegistry::builder()
        .failure_threshold(1)
        .recovery_timeout(Duration::from_secs(30))
        .retry_policy(quick_retries(3))
        .clock(clock.clone())
        .build();
    let breaker = registry.breaker("proxy-service-1");

    let _ = breaker.call(|| Err::<(), _>("503"));
    clock.advance(Duration::from_secs(30));

    let invoked = Arc::new(AtomicU32::new(0));
    let mut slow_probe = Box::pin(breaker.call_async(|| async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, &str>("summary")
    }));
    assert!(futures::poll!(&mut slow_probe).is_pending());
    assert_eq!(breaker.current_state(), State::HalfOpen);

    let other = registry
        .call("proxy-service-1", || {
            let invoked = Arc::clone(&invoked);
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>("summary")
            }
        })
        .await;

    assert!(matches!(other, Err(BreakerError::ProbeInFlight { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(registry.retrier().stats().attempts, 1);

    assert_eq!(slow_probe.await.unwrap(), "summary");
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_budget() {
    let registry = registry(5, 2);
    let invoked = Arc::new(AtomicU32::new(0));

    let result = registry
        .call("item-fetch", || {
            let invoked = Arc::clone(&invoked);
            async move {
                if invoked.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("502 bad gateway")
                } else {
                    Ok(8863)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 8863);
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    let snapshot = registry.stats_for("item-fetch").expect("breaker exists");
    assert_eq!(snapshot.state, State::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_last_operation_error() {
    let registry = registry(10, 2);
    let invoked = Arc::new(AtomicU32::new(0));

    let result = registry
        .call("proxy-service-2", || {
            let invoked = Arc::clone(&invoked);
            async move {
                let n = invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(format!("attempt {n} failed"))
            }
        })
        .await;

    match result {
        Err(BreakerError::Operation(msg)) => assert_eq!(msg, "attempt 2 failed"),
        other => panic!("expected operation error, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
    assert_eq!(registry.retrier().stats().exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_policy_override() {
    let registry = registry(10, 5);
    let invoked = Arc::new(AtomicU32::new(0));

    let result = registry
        .call_with_policy("item-fetch", &quick_retries(0), || {
            let invoked = Arc::clone(&invoked);
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("404")
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_through_registry() {
    let registry = registry(2, 3);

    let result = registry
        .call_with_timeout("proxy-service-1", Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, &str>("summary")
        })
        .await;

    // two timeouts open the breaker, the third attempt is rejected
    assert!(matches!(result, Err(BreakerError::Open { .. })));
    let snapshot = registry.stats_for("proxy-service-1").expect("breaker exists");
    assert_eq!(snapshot.timeout_count, 2);
    assert_eq!(snapshot.state, State::Open);
}

#[tokio::test(start_paused = true)]
async fn test_passthrough_registry_only_retries() {
    let registry = BreakerRegistry::builder()
        .failure_threshold(1)
        .retry_policy(quick_retries(2))
        .passthrough(true)
        .build();
    let invoked = Arc::new(AtomicU32::new(0));

    let result = registry
        .call("item-fetch", || {
            let invoked = Arc::clone(&invoked);
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("offline")
            }
        })
        .await;

    assert!(matches!(result, Err(BreakerError::Operation("offline"))));
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
    assert_eq!(
        registry.stats_for("item-fetch").map(|s| s.state),
        Some(State::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_all_clears_breakers_and_retry_state() {
    let registry = registry(1, 1);

    let _ = registry
        .call("item-fetch", || async { Err::<(), _>("down") })
        .await;
    assert_eq!(
        registry.stats_for("item-fetch").map(|s| s.state),
        Some(State::Open)
    );
    assert_ne!(registry.retrier().stats().attempts, 0);

    let shared = registry.clone();
    shared.reset_all();

    assert!(registry.is_empty());
    assert_eq!(registry.retrier().stats().attempts, 0);
    assert_eq!(registry.breaker("item-fetch").current_state(), State::Closed);
}
