//! Basic usage walk-through for the cyclegate crate.

use cyclegate::{LimiterConfig, LimiterEvent, RateLimiter};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== Permit Limiter Walk-through ===\n");

    immediate_grants();
    println!("\n{}\n", "=".repeat(50));

    waiting_acquire();
    println!("\n{}\n", "=".repeat(50));

    reserving();
    println!("\n{}\n", "=".repeat(50));

    draining_and_metrics();
    println!("\n{}\n", "=".repeat(50));

    events();
}

fn immediate_grants() {
    println!("1. Immediate grants and refusals:");

    // 5 permits per second, no waiting allowed.
    let limiter = RateLimiter::new(
        "demo",
        LimiterConfig::builder()
            .refresh_period(Duration::from_secs(1))
            .limit_per_period(5)
            .acquire_timeout(Duration::ZERO)
            .build()
            .unwrap(),
    );

    for i in 1..=7 {
        if limiter.acquire_one() {
            println!("   request {i}: granted");
        } else {
            println!("   request {i}: refused (budget spent)");
        }
    }
}

fn waiting_acquire() {
    println!("2. Waiting into the next cycle:");

    // 1 permit per 100ms, callers may sleep up to 300ms.
    let limiter = RateLimiter::new(
        "demo",
        LimiterConfig::builder()
            .refresh_period(Duration::from_millis(100))
            .limit_per_period(1)
            .acquire_timeout(Duration::from_millis(300))
            .build()
            .unwrap(),
    );

    for i in 1..=3 {
        let started = Instant::now();
        let granted = limiter.acquire_one();
        println!(
            "   request {i}: granted={granted} after {:?}",
            started.elapsed()
        );
    }
}

fn reserving() {
    println!("3. Reserving without sleeping:");

    let limiter = RateLimiter::new(
        "demo",
        LimiterConfig::builder()
            .refresh_period(Duration::from_millis(100))
            .limit_per_period(1)
            .acquire_timeout(Duration::from_millis(300))
            .build()
            .unwrap(),
    );

    for i in 1..=3 {
        match limiter.reserve_one() {
            Some(0) => println!("   reservation {i}: usable immediately"),
            Some(nanos) => println!(
                "   reservation {i}: usable in {:?}",
                Duration::from_nanos(nanos)
            ),
            None => println!("   reservation {i}: refused"),
        }
    }
}

fn draining_and_metrics() {
    println!("4. Draining and observing:");

    let limiter = RateLimiter::new(
        "demo",
        LimiterConfig::builder()
            .refresh_period(Duration::from_secs(1))
            .limit_per_period(10)
            .acquire_timeout(Duration::ZERO)
            .build()
            .unwrap(),
    );

    limiter.acquire(3);
    println!("   after acquire(3): {}", limiter.metrics());

    limiter.drain();
    println!("   after drain():    {}", limiter.metrics());
    println!("   health: {}", limiter.metrics().health_status());
}

fn events() {
    println!("5. Events:");

    let limiter = Arc::new(RateLimiter::new(
        "demo",
        LimiterConfig::builder()
            .refresh_period(Duration::from_secs(1))
            .limit_per_period(2)
            .acquire_timeout(Duration::ZERO)
            .build()
            .unwrap(),
    ));

    limiter.on_event(|event: &LimiterEvent| {
        println!("   event: {event:?}");
    });

    limiter.acquire_one();
    limiter.acquire_one();
    limiter.acquire_one(); // refused
    limiter.drain();

    // Events are delivered asynchronously; give the dispatcher a moment
    // before the process exits.
    std::thread::sleep(Duration::from_millis(100));
}
