//! # The limiter façade
//!
//! [`RateLimiter`] drives the optimistic update loop around the immutable
//! state snapshot and turns the computed wait into an actual (bounded,
//! cancellable) sleep.
//!
//! ## Lock-free shape
//!
//! Every state transition follows the same three steps:
//!
//! ```text
//!     read snapshot ──► compute successor ──► CAS the cell pointer
//!          ▲                (pure fn)               │
//!          │                                        │ lost the race?
//!          └────────── park 1 ns, retry ◄───────────┘
//! ```
//!
//! The compute step is a pure function of the snapshot, the request, and
//! the clock, so losing a race costs one recomputation and a nanosecond
//! back-off park; there is no queue, no lock, and no fairness order among
//! contenders. Whoever wins the CAS owns the transition and is the only
//! thread that publishes events for it.
//!
//! ## Waiting
//!
//! A successful CAS may still leave the caller with a non-zero wait: its
//! permits are reserved, but they mature at a future cycle boundary. The
//! caller then parks in a deadline loop that absorbs spurious wake-ups and
//! honours [`CancelToken`] cancellation. Cancelling a wait abandons the
//! permits without refunding them — undoing a reservation would race
//! against the accounting of every later caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam::epoch::{self, Atomic, Owned};
use tracing::debug;

use super::clock::{Clock, MonotonicClock};
use super::config::{CallOutcome, ConfigError, LimiterConfig};
use super::events::{EventHandler, EventKind, EventPublisher, LimiterEvent};
use super::metrics::LimiterMetrics;
use super::state::{next_state, LimiterState};

/// Back-off applied after a lost CAS. Constant rather than exponential:
/// under heavy contention a fixed nanosecond park keeps the cache line
/// quiet without ever de-scheduling winners for long. Platforms may round
/// this up to a scheduler tick, which is acceptable — the back-off is a
/// throughput hint, not a correctness mechanism.
const CAS_BACKOFF: Duration = Duration::from_nanos(1);

/// Cancellation handle for a waiting acquisition.
///
/// Rust threads carry no interrupt status, so cancellation is explicit: a
/// caller that may need to abandon a wait creates a token, passes it to
/// [`RateLimiter::acquire_cancellable`], and another thread calls
/// [`cancel`](CancelToken::cancel). The cancelled acquisition returns
/// `false` and the token stays observably cancelled, which is how the
/// caller tells a cancellation apart from an ordinary refusal.
///
/// Cancellation does not refund the reservation that was made on the
/// caller's behalf.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    waiter: Mutex<Option<Thread>>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the wait. Wakes the registered waiter, if any. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(thread) = waiter.as_ref() {
            thread.unpark();
        }
    }

    /// Whether [`cancel`](CancelToken::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn register_waiter(&self, thread: Thread) {
        let mut waiter = self
            .waiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *waiter = Some(thread);
    }

    fn clear_waiter(&self) {
        let mut waiter = self
            .waiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *waiter = None;
    }
}

/// Decrements the waiting-thread gauge on every exit path, including
/// cancellation and unwinding.
struct WaitingGuard<'a>(&'a AtomicU32);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A named, lock-free, cycle-based permit limiter.
///
/// Any number of threads may share one limiter behind an `Arc`. Permit
/// accounting lives in a single immutable snapshot behind an atomic cell;
/// callers either get their permits immediately, sleep until a reserved
/// permit matures, or are refused when the required wait exceeds the
/// configured timeout.
///
/// ```rust
/// use cyclegate::{LimiterConfig, RateLimiter};
/// use std::time::Duration;
///
/// let limiter = RateLimiter::new(
///     "search-api",
///     LimiterConfig::builder()
///         .refresh_period(Duration::from_secs(1))
///         .limit_per_period(10)
///         .acquire_timeout(Duration::ZERO)
///         .build()
///         .unwrap(),
/// );
///
/// assert!(limiter.acquire_one());
/// assert_eq!(limiter.metrics().available_permissions, 9);
/// ```
pub struct RateLimiter {
    name: Arc<str>,
    tags: HashMap<String, String>,
    clock: Arc<dyn Clock>,
    /// Clock reading captured at construction; all cycle arithmetic is
    /// relative to this anchor.
    anchor_nanos: u64,

    /// The one mutable datum: a pointer to the current immutable
    /// snapshot, replaced wholesale on every transition.
    state: Atomic<LimiterState>,

    /// Threads currently parked awaiting a reservation.
    waiting_threads: AtomicU32,

    // Lifetime counters. Monitoring data, deliberately outside the CAS
    // state: they tolerate relaxed ordering and must not widen the
    // contended cell.
    total_granted: AtomicU64,
    total_refused: AtomicU64,
    total_drains: AtomicU64,

    events: EventPublisher,
}

impl RateLimiter {
    /// Creates a limiter with no tags and the default monotonic clock.
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Self {
        Self::with_tags(name, config, HashMap::new())
    }

    /// Creates a limiter with observational tags.
    ///
    /// Tags do not affect behaviour; they ride along for whoever consumes
    /// the limiter's events and metrics.
    pub fn with_tags(
        name: impl Into<String>,
        config: LimiterConfig,
        tags: HashMap<String, String>,
    ) -> Self {
        Self::with_clock(name, config, tags, Arc::new(MonotonicClock::new()))
    }

    /// Creates a limiter on an explicit clock.
    ///
    /// The anchor for all cycle arithmetic is the clock reading taken
    /// here, so a [`ManualClock`](super::clock::ManualClock) starts the
    /// limiter at cycle zero regardless of its current reading.
    pub fn with_clock(
        name: impl Into<String>,
        config: LimiterConfig,
        tags: HashMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let anchor_nanos = clock.now_nanos();
        Self {
            name: Arc::from(name.into()),
            tags,
            clock,
            anchor_nanos,
            state: Atomic::new(LimiterState::initial(config)),
            waiting_threads: AtomicU32::new(0),
            total_granted: AtomicU64::new(0),
            total_refused: AtomicU64::new(0),
            total_drains: AtomicU64::new(0),
            events: EventPublisher::new(),
        }
    }

    /// The limiter's name, as carried by its events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The observational tags supplied at construction.
    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    /// The currently active configuration.
    pub fn config(&self) -> LimiterConfig {
        self.snapshot().config
    }

    /// Acquires one permit, waiting up to the configured timeout.
    #[inline]
    pub fn acquire_one(&self) -> bool {
        self.acquire(1)
    }

    /// Acquires `permits` permits, waiting up to the configured timeout.
    ///
    /// Returns `true` once the permits are granted. Returns `false` when
    /// the required wait exceeds the configured `acquire_timeout`; in that
    /// case the caller is still held for the timeout it signed up for, so
    /// refused callers cannot turn into a hot retry loop. Zero permits
    /// succeed immediately without touching any state.
    #[inline]
    pub fn acquire(&self, permits: u32) -> bool {
        self.acquire_permits(permits, None)
    }

    /// Like [`acquire`](RateLimiter::acquire), but the wait can be
    /// abandoned through `cancel`.
    ///
    /// On cancellation the call returns `false`, the token reports
    /// cancelled, and any reservation made for this caller remains
    /// deducted.
    pub fn acquire_cancellable(&self, permits: u32, cancel: &CancelToken) -> bool {
        self.acquire_permits(permits, Some(cancel))
    }

    /// Reserves one permit. See [`reserve`](RateLimiter::reserve).
    #[inline]
    pub fn reserve_one(&self) -> Option<u64> {
        self.reserve(1)
    }

    /// Reserves `permits` permits without parking.
    ///
    /// - `Some(0)`: granted, usable immediately.
    /// - `Some(n)`: reserved; the caller should wait `n` nanoseconds
    ///   before using them (the limiter does not sleep on its behalf).
    /// - `None`: not grantable within the configured timeout; nothing was
    ///   reserved.
    pub fn reserve(&self, permits: u32) -> Option<u64> {
        if permits == 0 {
            return Some(0);
        }
        let timeout_nanos = self.snapshot().config.acquire_timeout_nanos();
        let (_, installed) = self.update_state(|prev| {
            next_state(prev, permits, Some(timeout_nanos), self.current_nanos())
        });

        if installed.nanos_to_wait == 0 {
            self.record_acquisition(true, permits);
            return Some(0);
        }
        if timeout_nanos >= installed.nanos_to_wait {
            self.record_acquisition(true, permits);
            return Some(installed.nanos_to_wait);
        }
        self.record_acquisition(false, permits);
        None
    }

    /// Discards all currently available permits.
    ///
    /// The permit balance drops to zero whatever its sign: a positive
    /// balance is thrown away, a negative one (outstanding reservations,
    /// already granted to their waiters) is lifted to zero. Cycle, wait,
    /// and configuration are untouched. Emits
    /// [`LimiterEvent::Drained`] carrying the number of permits actually
    /// discarded, which is zero when only reservations were outstanding.
    pub fn drain(&self) {
        let (previous, _) = self.update_state(|prev| LimiterState {
            config: prev.config.clone(),
            active_cycle: prev.active_cycle,
            active_permissions: 0,
            nanos_to_wait: prev.nanos_to_wait,
        });
        self.total_drains.fetch_add(1, Ordering::Relaxed);

        let permits_discarded = previous.active_permissions.max(0) as u64;
        debug!(
            limiter = %self.name,
            permits_discarded,
            "drained available permits"
        );
        if self.events.has_subscribers() {
            self.events.publish(LimiterEvent::Drained {
                name: Arc::clone(&self.name),
                permits_discarded,
            });
        }
    }

    /// Reports a call outcome to the configured drain-on-result
    /// predicate, draining if it matches. Returns whether a drain
    /// happened. Without a configured predicate this never drains.
    pub fn drain_when(&self, outcome: &CallOutcome<'_>) -> bool {
        let config = self.snapshot().config;
        if config.drain_matches(outcome) {
            self.drain();
            true
        } else {
            false
        }
    }

    /// Replaces the acquire timeout, keeping every other setting and the
    /// whole permit state. In-flight reservations are unaffected.
    ///
    /// # Errors
    ///
    /// [`ConfigError::AcquireTimeoutTooLong`] when the duration does not
    /// fit 64-bit nanoseconds.
    pub fn change_timeout(&self, acquire_timeout: Duration) -> Result<(), ConfigError> {
        if acquire_timeout.as_nanos() > u64::MAX as u128 {
            return Err(ConfigError::AcquireTimeoutTooLong);
        }
        self.update_state(|prev| LimiterState {
            config: prev.config.replacing_acquire_timeout(acquire_timeout),
            active_cycle: prev.active_cycle,
            active_permissions: prev.active_permissions,
            nanos_to_wait: prev.nanos_to_wait,
        });
        debug!(limiter = %self.name, ?acquire_timeout, "changed acquire timeout");
        Ok(())
    }

    /// Replaces the permit budget per cycle, keeping every other setting
    /// and the whole permit state. The new budget applies from the next
    /// refresh onward; past accounting is not rewritten.
    ///
    /// # Errors
    ///
    /// [`ConfigError::LimitOutOfRange`] when `limit_per_period` is zero.
    pub fn change_limit_for_period(&self, limit_per_period: u32) -> Result<(), ConfigError> {
        if limit_per_period < 1 {
            return Err(ConfigError::LimitOutOfRange);
        }
        self.update_state(|prev| LimiterState {
            config: prev.config.replacing_limit_per_period(limit_per_period),
            active_cycle: prev.active_cycle,
            active_permissions: prev.active_permissions,
            nanos_to_wait: prev.nanos_to_wait,
        });
        debug!(limiter = %self.name, limit_per_period, "changed permit budget");
        Ok(())
    }

    /// Takes a read-only metrics snapshot.
    ///
    /// The gauge fields come from a simulation of the next-state function
    /// in observation mode, which structurally cannot reserve; calling
    /// this never changes what a concurrent `acquire` will see.
    pub fn metrics(&self) -> LimiterMetrics {
        let guard = epoch::pin();
        let current = self.state.load(Ordering::Acquire, &guard);
        // Safety: the cell is never null and a snapshot is only retired
        // after every guard pinned at replacement time has dropped.
        let state = unsafe { current.deref() };
        let estimated = next_state(state, 1, None, self.current_nanos());
        LimiterMetrics {
            available_permissions: estimated.active_permissions,
            nanos_to_wait: estimated.nanos_to_wait,
            cycle: estimated.active_cycle,
            waiting_threads: self.waiting_threads.load(Ordering::Acquire),
            limit_per_period: estimated.config.limit_per_period(),
            total_granted: self.total_granted.load(Ordering::Relaxed),
            total_refused: self.total_refused.load(Ordering::Relaxed),
            total_drains: self.total_drains.load(Ordering::Relaxed),
        }
    }

    /// Registers a handler for [`LimiterEvent::Success`] events.
    ///
    /// Handlers run on a dedicated dispatcher thread; panics are
    /// contained there and never reach the limiter or its callers.
    pub fn on_success(&self, handler: impl Fn(&LimiterEvent) + Send + Sync + 'static) {
        self.subscribe(Some(EventKind::Success), Box::new(handler));
    }

    /// Registers a handler for [`LimiterEvent::Failure`] events.
    pub fn on_failure(&self, handler: impl Fn(&LimiterEvent) + Send + Sync + 'static) {
        self.subscribe(Some(EventKind::Failure), Box::new(handler));
    }

    /// Registers a handler for [`LimiterEvent::Drained`] events.
    pub fn on_drained(&self, handler: impl Fn(&LimiterEvent) + Send + Sync + 'static) {
        self.subscribe(Some(EventKind::Drained), Box::new(handler));
    }

    /// Registers a handler for every event kind.
    pub fn on_event(&self, handler: impl Fn(&LimiterEvent) + Send + Sync + 'static) {
        self.subscribe(None, Box::new(handler));
    }

    fn subscribe(&self, kind: Option<EventKind>, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// Nanoseconds elapsed since this limiter's construction anchor.
    #[inline]
    fn current_nanos(&self) -> u64 {
        self.clock.now_nanos().saturating_sub(self.anchor_nanos)
    }

    /// Clones the current snapshot out of the cell.
    fn snapshot(&self) -> LimiterState {
        let guard = epoch::pin();
        let current = self.state.load(Ordering::Acquire, &guard);
        // Safety: see `metrics`.
        unsafe { current.deref() }.clone()
    }

    /// The optimistic update loop. Recomputes the successor from a fresh
    /// snapshot (and a fresh clock reading, via `compute`) on every
    /// attempt; a lost race parks for [`CAS_BACKOFF`] before retrying.
    /// Returns clones of the replaced and the installed snapshots.
    fn update_state<F>(&self, compute: F) -> (LimiterState, LimiterState)
    where
        F: Fn(&LimiterState) -> LimiterState,
    {
        let guard = epoch::pin();
        loop {
            let current = self.state.load(Ordering::Acquire, &guard);
            // Safety: see `metrics`.
            let prev = unsafe { current.deref() };
            let next = compute(prev);
            let installed = next.clone();
            match self.state.compare_exchange(
                current,
                Owned::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    let previous = prev.clone();
                    // Safety: `current` was just unlinked by this thread;
                    // no new reader can reach it, and existing readers
                    // hold guards that delay the destruction.
                    unsafe { guard.defer_destroy(current) };
                    return (previous, installed);
                }
                Err(_) => thread::park_timeout(CAS_BACKOFF),
            }
        }
    }

    fn acquire_permits(&self, permits: u32, cancel: Option<&CancelToken>) -> bool {
        if permits == 0 {
            return true;
        }
        let timeout_nanos = self.snapshot().config.acquire_timeout_nanos();
        let (_, installed) = self.update_state(|prev| {
            next_state(prev, permits, Some(timeout_nanos), self.current_nanos())
        });
        let granted =
            self.wait_for_permission_if_necessary(timeout_nanos, installed.nanos_to_wait, cancel);
        self.record_acquisition(granted, permits);
        granted
    }

    /// Decides between the three request outcomes: immediate grant,
    /// grant after parking, refusal after parking out the caller's own
    /// timeout.
    fn wait_for_permission_if_necessary(
        &self,
        timeout_nanos: u64,
        nanos_to_wait: u64,
        cancel: Option<&CancelToken>,
    ) -> bool {
        if nanos_to_wait == 0 {
            return true;
        }
        if timeout_nanos >= nanos_to_wait {
            return self.wait_for_permission(nanos_to_wait, cancel);
        }
        // Refused. The permits were not reserved, but the caller still
        // waits out its timeout so refusals cannot tighten into a spin.
        self.wait_for_permission(timeout_nanos, cancel);
        false
    }

    /// Parks until `nanos` have elapsed or the token is cancelled.
    /// Early wake-ups re-check the deadline and re-park the remainder.
    /// Returns `true` when the full wait elapsed uncancelled.
    fn wait_for_permission(&self, nanos: u64, cancel: Option<&CancelToken>) -> bool {
        self.waiting_threads.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitingGuard(&self.waiting_threads);

        if let Some(token) = cancel {
            token.register_waiter(thread::current());
        }

        let deadline = self.current_nanos().saturating_add(nanos);
        let mut cancelled = cancel.map_or(false, CancelToken::is_cancelled);
        while !cancelled {
            let now = self.current_nanos();
            if now >= deadline {
                break;
            }
            thread::park_timeout(Duration::from_nanos(deadline - now));
            cancelled = cancel.map_or(false, CancelToken::is_cancelled);
        }

        if let Some(token) = cancel {
            token.clear_waiter();
        }
        !cancelled
    }

    /// Bumps the lifetime counters and publishes the grant/refusal event.
    /// Runs strictly after the CAS loop: only the winning thread reports,
    /// exactly once.
    fn record_acquisition(&self, granted: bool, permits: u32) {
        if granted {
            self.total_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_refused.fetch_add(1, Ordering::Relaxed);
        }
        if !self.events.has_subscribers() {
            return;
        }
        let event = if granted {
            LimiterEvent::Success {
                name: Arc::clone(&self.name),
                permits,
            }
        } else {
            LimiterEvent::Failure {
                name: Arc::clone(&self.name),
                permits,
            }
        };
        self.events.publish(event);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &state.config)
            .field("active_cycle", &state.active_cycle)
            .field("active_permissions", &state.active_permissions)
            .field(
                "waiting_threads",
                &self.waiting_threads.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        // Epoch reclamation covers replaced snapshots; the final one is
        // still owned by the cell and freed here.
        let state = std::mem::replace(&mut self.state, Atomic::null());
        // Safety: `&mut self` proves no concurrent reader exists, and the
        // cell is never null.
        unsafe {
            drop(state.into_owned());
        }
    }
}
