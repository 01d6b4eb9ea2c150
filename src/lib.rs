//! # Cyclegate - Lock-Free Cycle-Based Permit Limiter
//!
//! A rate limiter for high-concurrency in-process use: any number of
//! threads ask a named limiter for permits and are granted them
//! immediately, granted after a bounded sleep, or refused. No mutexes
//! anywhere near the accounting — every state transition is one atomic
//! compare-and-swap on an immutable snapshot.
//!
//! ## How it works
//!
//! Time is split into *cycles* of `refresh_period`. Each cycle carries a
//! budget of `limit_per_period` permits. Callers that find the budget
//! spent may *reserve* permits from future cycles and sleep until the
//! reservation matures, as long as the sleep fits their configured
//! timeout:
//!
//! ```text
//!     limit_per_period = 2, refresh_period = 100ms
//!
//!     t=0ms    caller A: acquire(1) ✅ immediately  (balance 1)
//!     t=1ms    caller B: acquire(1) ✅ immediately  (balance 0)
//!     t=2ms    caller C: acquire(1) 💤 balance -1, sleeps ~98ms,
//!                        wakes at the cycle boundary and proceeds
//!     t=3ms    caller D: timeout 10ms < 97ms wait ⛔ refused
//! ```
//!
//! A negative balance is deliberate: it is how reserved future permits
//! are accounted. Idle cycles refresh the budget but never stack it —
//! after an idle hour you still get one cycle's worth, not an hour's.
//!
//! ## Quick start
//!
//! ```rust
//! use cyclegate::{LimiterConfig, RateLimiter};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(
//!     "payment-api",
//!     LimiterConfig::builder()
//!         .refresh_period(Duration::from_secs(1))
//!         .limit_per_period(50)
//!         .acquire_timeout(Duration::from_millis(250))
//!         .build()
//!         .unwrap(),
//! );
//!
//! if limiter.acquire_one() {
//!     // proceed with the call
//! } else {
//!     // refused within 250ms; shed the request
//! }
//! ```
//!
//! ## Reserving instead of sleeping
//!
//! Callers that integrate with their own scheduler can take the wait as
//! a number instead of a nap:
//!
//! ```rust
//! use cyclegate::{LimiterConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new("batch", LimiterConfig::default());
//! match limiter.reserve_one() {
//!     Some(0) => { /* granted, go now */ }
//!     Some(nanos) => { /* granted, usable after `nanos` */ }
//!     None => { /* not grantable within the timeout */ }
//! }
//! ```
//!
//! ## Observing
//!
//! Metrics are forecasts computed from the current snapshot without
//! touching it, and events are delivered on a dedicated dispatcher
//! thread so a slow subscriber can never stall a caller:
//!
//! ```rust
//! use cyclegate::{LimiterConfig, LimiterEvent, RateLimiter};
//!
//! let limiter = RateLimiter::new("api", LimiterConfig::default());
//! limiter.on_failure(|event| {
//!     if let LimiterEvent::Failure { name, permits } = event {
//!         eprintln!("{name}: refused {permits} permit(s)");
//!     }
//! });
//!
//! let metrics = limiter.metrics();
//! println!("available: {}", metrics.available_permissions);
//! ```
//!
//! ## Guarantees
//!
//! - The configuration and the permit accounting live in one snapshot
//!   and change together; no thread ever observes a torn combination.
//! - Successful transitions are totally ordered by the CAS; cycle
//!   numbers never run backwards.
//! - `acquire` never grants more than one cycle's budget per cycle
//!   window (plus at most one cycle's head start after idleness).
//! - No FIFO fairness among waiters, by design: each contender
//!   recomputes against the freshest snapshot.
//!
//! ## Threading model
//!
//! Plain OS threads; the blocking calls park the calling thread. Share a
//! limiter with `Arc`; all methods take `&self`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

mod rate_limiter;

pub use rate_limiter::{
    CallOutcome, CancelToken, Clock, ConfigError, DrainPredicate, EventHandler, EventKind,
    HealthStatus, LimiterConfig, LimiterConfigBuilder, LimiterEvent, LimiterMetrics, ManualClock,
    MonotonicClock, RateLimiter, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LIMIT_PER_PERIOD,
    DEFAULT_REFRESH_PERIOD,
};

/// A rate limiter wrapped in `Arc` for convenient sharing across threads.
///
/// ```rust
/// use cyclegate::{LimiterConfig, RateLimiter, SharedRateLimiter};
/// use std::sync::Arc;
///
/// let shared: SharedRateLimiter =
///     Arc::new(RateLimiter::new("api", LimiterConfig::default()));
///
/// let clone = shared.clone();
/// std::thread::spawn(move || {
///     clone.acquire_one();
/// });
/// ```
pub type SharedRateLimiter = std::sync::Arc<RateLimiter>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use cyclegate::prelude::*;
///
/// let limiter = RateLimiter::new("api", LimiterConfig::default());
/// assert!(limiter.acquire_one());
/// ```
pub mod prelude {
    //! Common imports for typical uses of the limiter.

    pub use crate::{
        CallOutcome, CancelToken, HealthStatus, LimiterConfig, LimiterEvent, LimiterMetrics,
        RateLimiter, SharedRateLimiter,
    };
}
