//! Several call sites sharing breakers through one registry.
//!
//! Run with `RUST_LOG=debug` to see state transitions and retries.

use fetchguard::{BreakerError, HookRegistry, RegistryBuilder, ResilienceConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[breaker]
failure_threshold = 3
recovery_timeout_ms = 1500

[retry]
max_retries = 2
base_delay_ms = 100
max_delay_ms = 1000

[endpoints.proxy-service-1]
failure_threshold = 2
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ResilienceConfig::from_toml_str(CONFIG)?;

    let hooks = HookRegistry::new();
    hooks.set_on_open(|endpoint| println!("-- {endpoint}: circuit OPENED"));
    hooks.set_on_half_open(|endpoint| println!("-- {endpoint}: probing recovery"));
    hooks.set_on_close(|endpoint| println!("-- {endpoint}: circuit CLOSED"));

    let registry = RegistryBuilder::from_config(&config).hooks(hooks).build();

    // The first proxy is down for its first 6 requests, the item API is healthy.
    let proxy_requests = Arc::new(AtomicU32::new(0));

    for round in 1..=6 {
        println!("\nRound {round}");

        let item = registry
            .call("item-fetch", || async { Ok::<_, String>("story 8863") })
            .await;
        println!("item-fetch      -> {item:?}");

        let summary = registry
            .call("proxy-service-1", || {
                let requests = Arc::clone(&proxy_requests);
                async move {
                    if requests.fetch_add(1, Ordering::SeqCst) < 6 {
                        Err("proxy returned 503".to_string())
                    } else {
                        Ok("article summary".to_string())
                    }
                }
            })
            .await;

        match summary {
            Ok(text) => println!("proxy-service-1 -> {text}"),
            Err(BreakerError::Open { retry_after, .. }) => {
                println!("proxy-service-1 -> skipped, retry in {}ms", retry_after.as_millis());
                tokio::time::sleep(retry_after).await;
            }
            Err(err) => println!("proxy-service-1 -> {err}"),
        }
    }

    println!("\nFinal statistics:");
    for (endpoint, stats) in registry.stats() {
        println!(
            "  {endpoint:<16} state={:<9} failures={} successes={} rejected={}",
            stats.state.as_str(),
            stats.failure_count,
            stats.success_count,
            stats.rejected_count
        );
    }
    println!("  retries: {:?}", registry.retrier().stats());

    Ok(())
}
