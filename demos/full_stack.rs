//! Full stack example: factory + breaker + retry + fallback + health monitor.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tripwire::{BreakerFactory, ResilienceError, ResourceProfile, TracingMetrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let factory = BreakerFactory::new().with_metrics(Arc::new(TracingMetrics));
    let retry = factory.create_with_retry::<String, std::io::Error>("weather_api", ResourceProfile::ExternalApi)?;
    retry.breaker().set_static_response("last_known", "sunny (cached)".to_string());

    let monitor = factory.health_monitor(Duration::from_secs(5))?.spawn();

    let attempts = Arc::new(AtomicUsize::new(0));
    let result: Result<String, ResilienceError<std::io::Error>> = retry
        .execute(|| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "transient"))
                } else {
                    Ok("rain".to_string())
                }
            }
        })
        .await;

    println!("forecast: {}", result?);
    println!("retry metrics: {:?}", retry.metrics());
    for stats in factory.registry().snapshot() {
        println!("{}: {} ({} calls)", stats.name, stats.state, stats.total_calls);
    }

    monitor.shutdown().await;
    Ok(())
}
