//! Webhook ingestion walk-through: dedup, rate limit, breaker, retry
//!
//! Run with `RUST_LOG=debug cargo run --example basic` to see the structured logs.

use resilience_machines::{
    CancelSignal, CircuitError, IdempotencyManager, KeyedRateLimiter,
    ResilienceConfig, RetryError, Retryer, client_key,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[circuit_breaker]
timeout_secs = 1

[circuit_breaker.trip]
kind = "consecutive_failures"
threshold = 2

[retry]
max_attempts = 3
base_delay_ms = 50
max_delay_ms = 200

[rate_limit]
requests_per_second = 2.0
burst = 3
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ResilienceConfig::from_toml_str(CONFIG)?;

    println!("=== Idempotency ===\n");
    let dedup = IdempotencyManager::in_memory(config.idempotency.ttl())?;
    let payload = br#"{"alert":"db-primary down","severity":"critical"}"#;
    println!("key: {}", IdempotencyManager::generate_key_from_payload(payload));
    for delivery in 1..=2 {
        if dedup.claim(payload)? {
            println!("delivery {delivery}: processing");
        } else {
            println!("delivery {delivery}: duplicate, acknowledged without processing");
        }
    }

    println!("\n=== Rate limiting ===\n");
    let limiter = Arc::new(KeyedRateLimiter::new(config.rate_limit.clone())?);
    let _sweeper = limiter.spawn_sweeper();
    let key = client_key(Some("203.0.113.9, 10.0.0.2"), None, "10.0.0.2:41000");
    for i in 1..=4 {
        match limiter.check(&key) {
            Ok(admission) => {
                let headers = admission.quota().map(|q| q.header_pairs());
                println!("request {i} from {key}: admitted {headers:?}");
            }
            Err(limited) => println!("request {i} from {key}: 429, {limited}"),
        }
    }

    println!("\n=== Circuit breaker ===\n");
    let breaker = config
        .circuit_breaker
        .builder("slack")
        .on_open(|name| println!("circuit '{name}' opened"))
        .on_half_open(|name| println!("circuit '{name}' half-open, probing"))
        .on_close(|name| println!("circuit '{name}' closed"))
        .build()?;

    for i in 1..=3 {
        match breaker.call(|| Err::<(), _>(format!("slack returned 503 ({i})"))) {
            Ok(()) => println!("call {i}: delivered"),
            Err(CircuitError::Rejected(rejected)) => println!("call {i}: fast-fail, {rejected}"),
            Err(CircuitError::Execution(e)) => println!("call {i}: failed, {e}"),
        }
    }
    println!("state: {}", breaker.state());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let probe = breaker.call(|| Ok::<_, String>("delivered"));
    println!("probe after timeout: {probe:?}, state: {}", breaker.state());

    println!("\n=== Retry ===\n");
    let retryer = Retryer::new(config.retry.policy())?;
    let calls = AtomicU32::new(0);
    let result = retryer
        .execute(&CancelSignal::new().with_timeout(Duration::from_secs(5)), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("telegram timeout on attempt {}", n + 1))
                } else {
                    Ok("sent")
                }
            }
        })
        .await;
    println!("result: {result:?} after {} attempts", calls.load(Ordering::SeqCst));

    let permanent: Result<(), RetryError<String>> = retryer
        .execute(&CancelSignal::new(), || async {
            Err("invalid chat id".to_string())
        })
        .await;
    if let Err(e) = permanent {
        println!("permanent failure: {e}");
    }

    Ok(())
}
