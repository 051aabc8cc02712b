//! Demonstrates a per-call timeout answered by the fallback chain.
use std::time::Duration;
use tripwire::{CircuitBreaker, CircuitBreakerConfig, FallbackReason};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = CircuitBreakerConfig { timeout: Duration::from_millis(100), ..Default::default() };
    let breaker: CircuitBreaker<&'static str, std::io::Error> = CircuitBreaker::new("quotes", config)?;
    breaker.register_fallback("stale_quote", |ctx| match ctx.reason {
        FallbackReason::Timeout => Ok("stale quote"),
        _ => Err("only timeouts are served stale".into()),
    });

    let fast = breaker.call(|| async { Ok("fresh quote") }).await?;
    println!("fast path: {fast}");

    let slow = breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("late quote")
        })
        .await?;
    println!("fallback path: {slow}");

    println!("stats: {:?}", breaker.stats());
    Ok(())
}
