//! Internal implementation of the permit limiter.
//!
//! ## Module structure
//!
//! ```text
//!     rate_limiter/
//!     ├── mod.rs       (module organization, re-exports)
//!     ├── config.rs    (immutable configuration + builder)
//!     ├── clock.rs     (monotonic time sources)
//!     ├── state.rs     (immutable snapshot + pure next-state function)
//!     ├── core.rs      (the façade: CAS loop, waiting, cancellation)
//!     ├── events.rs    (event kinds + asynchronous dispatch)
//!     └── metrics.rs   (read-only observation)
//! ```
//!
//! ## Data flow
//!
//! ```text
//!     caller ──► core ──► read snapshot ──► state::next_state ──► CAS
//!                 │                                                │
//!                 ├── park until the reservation matures ◄─────────┤
//!                 └── events (async, off the caller's thread) ◄────┘
//! ```
//!
//! `state` is the only module with interesting arithmetic; `core` is the
//! only module with interesting interleavings. Everything else is
//! plumbing around those two.

mod clock;
mod config;
mod core;
mod events;
mod metrics;
mod state;

pub use self::clock::{Clock, ManualClock, MonotonicClock};

pub use self::config::{
    CallOutcome, ConfigError, DrainPredicate, LimiterConfig, LimiterConfigBuilder,
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_LIMIT_PER_PERIOD, DEFAULT_REFRESH_PERIOD,
};

pub use self::core::{CancelToken, RateLimiter};

pub use self::events::{EventHandler, EventKind, LimiterEvent};

pub use self::metrics::{HealthStatus, LimiterMetrics};
