use fetchguard::{BreakerError, CircuitBreaker};
use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct FetchError(String);

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch error: {}", self.0)
    }
}

impl Error for FetchError {}

fn main() {
    let breaker = CircuitBreaker::builder("item-fetch")
        .failure_threshold(3) // three failures in a row open the circuit
        .recovery_timeout(Duration::from_secs(2))
        .build();

    println!("Circuit initial state: {}", breaker.current_state());

    let mut requests = 0;

    // Calls 4..=8 fail, everything else succeeds
    let mut fetch_item = || -> Result<String, FetchError> {
        requests += 1;
        if (4..=8).contains(&requests) {
            Err(FetchError("upstream unavailable".to_string()))
        } else {
            Ok(format!("item #{requests}"))
        }
    };

    for i in 1..=15 {
        print!("Attempt {i:>2}: ");

        match breaker.call(&mut fetch_item) {
            Ok(item) => println!("fetched {item}"),
            Err(BreakerError::Open { retry_after, .. }) => {
                println!("circuit open, retry in {}ms", retry_after.as_millis());
                thread::sleep(Duration::from_millis(500));
            }
            Err(err) => println!("call failed: {err}"),
        }

        let snapshot = breaker.snapshot();
        println!(
            "            state: {}, consecutive failures: {}",
            snapshot.state, snapshot.failure_count
        );

        thread::sleep(Duration::from_millis(100));
    }
}
