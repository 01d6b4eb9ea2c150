use cyclegate::{
    CancelToken, Clock, EventKind, LimiterConfig, LimiterEvent, ManualClock, RateLimiter,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn config(refresh: Duration, limit: u32, timeout: Duration) -> LimiterConfig {
    LimiterConfig::builder()
        .refresh_period(refresh)
        .limit_per_period(limit)
        .acquire_timeout(timeout)
        .build()
        .unwrap()
}

fn manual_limiter(
    name: &str,
    refresh: Duration,
    limit: u32,
    timeout: Duration,
) -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::with_clock(
        name,
        config(refresh, limit, timeout),
        HashMap::new(),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    (limiter, clock)
}

#[test]
fn immediate_grant_from_a_fresh_limiter() {
    let (limiter, _clock) = manual_limiter(
        "fresh",
        Duration::from_secs(1),
        10,
        Duration::ZERO,
    );

    assert!(limiter.acquire_one());

    let metrics = limiter.metrics();
    assert_eq!(metrics.available_permissions, 9);
    assert_eq!(metrics.nanos_to_wait, 0);
    assert_eq!(metrics.waiting_threads, 0);
}

#[test]
fn budget_refreshes_after_the_cycle_boundary() {
    let (limiter, clock) = manual_limiter(
        "refresh",
        Duration::from_secs(1),
        10,
        Duration::ZERO,
    );

    // Spend the whole budget at t=0.
    assert!(limiter.acquire(10));

    // Mid-cycle the wait would be 500ms against a zero budget: refused.
    clock.advance(Duration::from_millis(500));
    assert!(!limiter.acquire_one());

    // Past the boundary the budget is back.
    clock.advance(Duration::from_millis(600));
    assert!(limiter.acquire_one());
    assert_eq!(limiter.metrics().available_permissions, 9);
}

#[test]
fn waiting_acquire_sleeps_into_the_next_cycle() {
    // Real clock: the point is the actual park.
    let limiter = RateLimiter::new(
        "sleepy",
        config(Duration::from_millis(100), 1, Duration::from_millis(200)),
    );

    assert!(limiter.acquire_one());

    let started = Instant::now();
    assert!(limiter.acquire_one());
    let elapsed = started.elapsed();

    // The second grant had to wait for the 100ms boundary. Leave wide
    // margins for scheduler noise.
    assert!(elapsed >= Duration::from_millis(40), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(200), "elapsed {elapsed:?}");
}

#[test]
fn three_contenders_against_a_budget_of_two() {
    let limiter = Arc::new(RateLimiter::new(
        "contenders",
        config(Duration::from_millis(100), 2, Duration::from_secs(1)),
    ));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let started = Instant::now();
                let granted = limiter.acquire_one();
                (granted, started.elapsed())
            })
        })
        .collect();

    let results: Vec<(bool, Duration)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Everyone is granted: two immediately, the third after parking
    // until the next cycle boundary.
    assert!(results.iter().all(|(granted, _)| *granted));
    let slowest = results.iter().map(|(_, e)| *e).max().unwrap();
    assert!(slowest < Duration::from_millis(900), "slowest {slowest:?}");

    // The matured reservation belongs to the new cycle; the balance is
    // back in non-negative territory.
    assert!(limiter.metrics().available_permissions >= 0);
}

#[test]
fn matured_reservation_counts_against_the_new_cycle() {
    // Deterministic rendition of the three-contenders scenario.
    let (limiter, clock) = manual_limiter(
        "ledger",
        Duration::from_millis(100),
        2,
        Duration::from_secs(1),
    );

    assert_eq!(limiter.reserve_one(), Some(0));
    assert_eq!(limiter.reserve_one(), Some(0));

    // Third caller reserves into the next cycle.
    let wait = limiter.reserve_one().unwrap();
    assert_eq!(wait, 100_000_000);
    assert_eq!(limiter.metrics().available_permissions, -1);

    // At the boundary the reservation has matured: one permit of the new
    // cycle's two is already spoken for.
    clock.advance(Duration::from_millis(100));
    assert_eq!(limiter.metrics().available_permissions, 1);
}

#[test]
fn drain_discards_the_rest_of_the_period() {
    let (limiter, _clock) = manual_limiter(
        "drained",
        Duration::from_secs(1),
        10,
        Duration::ZERO,
    );

    assert!(limiter.acquire_one());
    assert_eq!(limiter.metrics().available_permissions, 9);

    limiter.drain();

    let metrics = limiter.metrics();
    assert_eq!(metrics.available_permissions, 0);
    assert!(metrics.nanos_to_wait > 0);
    assert_eq!(limiter.reserve_one(), None);
}

#[test]
fn reserve_refuses_beyond_the_timeout_without_reserving() {
    let (limiter, clock) = manual_limiter(
        "sentinel",
        Duration::from_millis(100),
        1,
        Duration::from_millis(50),
    );

    assert_eq!(limiter.reserve_one(), Some(0));
    clock.advance(Duration::from_millis(20));

    // The wait would be 80ms against a 50ms budget.
    assert_eq!(limiter.reserve_one(), None);
    assert_eq!(limiter.metrics().available_permissions, 0);
    assert_eq!(limiter.metrics().total_refused, 1);
}

#[test]
fn hour_long_idle_gap_grants_one_cycle_of_credit() {
    let (limiter, clock) = manual_limiter(
        "idle",
        Duration::from_millis(1),
        5,
        Duration::ZERO,
    );

    clock.advance(Duration::from_secs(3_600));

    assert!(limiter.acquire_one());
    let metrics = limiter.metrics();
    assert_eq!(metrics.available_permissions, 4);
    assert_eq!(metrics.cycle, 3_600_000);
}

#[test]
fn throughput_stays_within_the_cycle_budget() {
    const THREADS: usize = 8;
    const REFRESH: Duration = Duration::from_millis(100);
    const LIMIT: u64 = 10;

    let limiter = Arc::new(RateLimiter::new(
        "throughput",
        config(REFRESH, LIMIT as u32, Duration::ZERO),
    ));

    let started = Instant::now();
    let deadline = started + Duration::from_secs(1);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let mut granted = 0u64;
                while Instant::now() < deadline {
                    if limiter.acquire_one() {
                        granted += 1;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
                granted
            })
        })
        .collect();

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let elapsed = started.elapsed();

    // At most one cycle's budget per elapsed cycle, plus the one-cycle
    // head start a fresh limiter carries.
    let refresh_nanos = REFRESH.as_nanos();
    let elapsed_cycles = ((elapsed.as_nanos() + refresh_nanos - 1) / refresh_nanos) as u64;
    let upper_bound = elapsed_cycles * LIMIT + LIMIT;
    assert!(
        total <= upper_bound,
        "granted {total}, bound {upper_bound}, elapsed {elapsed:?}"
    );
    assert!(total >= LIMIT, "granted {total}");
}

#[test]
fn grant_refusal_and_drain_events_reach_subscribers() {
    let (limiter, _clock) = manual_limiter(
        "evented",
        Duration::from_secs(1),
        2,
        Duration::ZERO,
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    limiter.on_event(move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    assert!(limiter.acquire_one()); // Success
    limiter.drain(); // Drained, one permit thrown away
    assert!(!limiter.acquire_one()); // Failure

    wait_until(|| events.lock().unwrap().len() == 3);

    let events = events.lock().unwrap();
    assert_eq!(events[0].kind(), EventKind::Success);
    assert_eq!(
        events[1],
        LimiterEvent::Drained {
            name: Arc::from("evented"),
            permits_discarded: 1,
        }
    );
    assert_eq!(events[2].kind(), EventKind::Failure);
    assert!(events.iter().all(|e| e.limiter_name() == "evented"));
}

#[test]
fn drain_reports_discarded_permits() {
    // Pins the drain payload semantics: the count of available permits
    // actually thrown away, zero when only reservations were
    // outstanding.
    let (limiter, clock) = manual_limiter(
        "drain-payload",
        Duration::from_millis(100),
        10,
        Duration::from_secs(1),
    );

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&payloads);
    limiter.on_drained(move |event| {
        if let LimiterEvent::Drained {
            permits_discarded, ..
        } = event
        {
            sink.lock().unwrap().push(*permits_discarded);
        }
    });

    // Positive balance: 9 permits discarded.
    assert!(limiter.acquire_one());
    limiter.drain();

    // Negative balance: drive the ledger to -1, then drain. Nothing
    // available was discarded.
    clock.advance(Duration::from_millis(100));
    assert!(limiter.acquire(10));
    clock.advance(Duration::from_millis(10));
    assert!(limiter.reserve_one().is_some());
    assert_eq!(limiter.metrics().available_permissions, -1);
    limiter.drain();

    wait_until(|| payloads.lock().unwrap().len() == 2);
    assert_eq!(*payloads.lock().unwrap(), vec![9, 0]);
}

#[test]
fn panicking_subscriber_is_contained() {
    let (limiter, _clock) = manual_limiter(
        "panicky",
        Duration::from_secs(1),
        5,
        Duration::ZERO,
    );

    let delivered = Arc::new(AtomicU32::new(0));
    limiter.on_success(|_| panic!("subscriber bug"));
    let counter = Arc::clone(&delivered);
    limiter.on_success(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(limiter.acquire_one());
    assert!(limiter.acquire_one());

    // The panicking handler neither poisons the dispatcher nor skips
    // the healthy one.
    wait_until(|| delivered.load(Ordering::SeqCst) == 2);
}

#[test]
fn cancelled_waiter_is_refused_but_stays_accounted() {
    let limiter = Arc::new(RateLimiter::new(
        "cancelled",
        config(Duration::from_secs(10), 1, Duration::from_secs(30)),
    ));
    assert!(limiter.acquire_one());

    let token = Arc::new(CancelToken::new());
    let waiter = {
        let limiter = Arc::clone(&limiter);
        let token = Arc::clone(&token);
        thread::spawn(move || limiter.acquire_cancellable(1, &token))
    };

    wait_until(|| limiter.metrics().waiting_threads == 1);
    token.cancel();

    assert!(!waiter.join().unwrap());
    assert!(token.is_cancelled());
    assert_eq!(limiter.metrics().waiting_threads, 0);
    assert_eq!(limiter.metrics().available_permissions, -1);
}

#[test]
fn runtime_reconfiguration_does_not_disturb_the_ledger() {
    let (limiter, clock) = manual_limiter(
        "retuned",
        Duration::from_millis(100),
        4,
        Duration::ZERO,
    );

    assert!(limiter.acquire(3));
    assert_eq!(limiter.metrics().available_permissions, 1);

    limiter.change_limit_for_period(8).unwrap();
    limiter
        .change_timeout(Duration::from_millis(250))
        .unwrap();

    // The current cycle's balance survived both changes.
    assert_eq!(limiter.metrics().available_permissions, 1);

    // The new budget applies from the next refresh onward.
    clock.advance(Duration::from_millis(100));
    assert_eq!(limiter.metrics().available_permissions, 8);
}

#[test]
fn tags_are_observational() {
    let mut tags = HashMap::new();
    tags.insert("tier".to_string(), "gold".to_string());
    let limiter = RateLimiter::with_tags(
        "tagged",
        config(Duration::from_secs(1), 5, Duration::ZERO),
        tags,
    );

    assert_eq!(limiter.tags().get("tier").map(String::as_str), Some("gold"));
    assert!(limiter.acquire_one());
}

fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within 2.5 seconds");
}
