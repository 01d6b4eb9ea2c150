//! Limiter events and their asynchronous delivery.
//!
//! The limiter reports three things: a grant, a refusal, and a drain.
//! Handlers run on a dedicated dispatcher thread, never on the thread that
//! won the state update — publication is one non-blocking enqueue, so a
//! slow or panicking handler cannot stall or corrupt permit accounting.
//!
//! ```text
//!     acquire()/drain()          dispatcher thread
//!         │                            │
//!         ├─ CAS wins                  │
//!         ├─ send(event) ──channel──► recv(event)
//!         └─ returns                   ├─ handler 1
//!                                      ├─ handler 2   (panics are
//!                                      └─ handler 3    contained)
//! ```
//!
//! When nothing is subscribed, nothing is enqueued: publication is gated
//! on a subscriber count, so unobserved limiters pay one atomic load and
//! no allocation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::warn;

/// The three kinds of limiter event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Permits were granted (immediately or after a completed wait).
    Success,
    /// Permits were refused because the wait exceeded the caller's budget.
    Failure,
    /// The available balance was discarded by a drain.
    Drained,
}

/// An event emitted by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Permits were granted.
    Success {
        /// Name of the emitting limiter.
        name: Arc<str>,
        /// Number of permits granted.
        permits: u32,
    },
    /// Permits were refused.
    Failure {
        /// Name of the emitting limiter.
        name: Arc<str>,
        /// Number of permits that were requested.
        permits: u32,
    },
    /// Available permits were discarded.
    Drained {
        /// Name of the emitting limiter.
        name: Arc<str>,
        /// Number of available permits thrown away (never negative;
        /// a drain that only found reservations reports zero).
        permits_discarded: u64,
    },
}

impl LimiterEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            LimiterEvent::Success { .. } => EventKind::Success,
            LimiterEvent::Failure { .. } => EventKind::Failure,
            LimiterEvent::Drained { .. } => EventKind::Drained,
        }
    }

    /// Name of the limiter that emitted this event.
    pub fn limiter_name(&self) -> &str {
        match self {
            LimiterEvent::Success { name, .. }
            | LimiterEvent::Failure { name, .. }
            | LimiterEvent::Drained { name, .. } => name,
        }
    }
}

/// Callback invoked on the dispatcher thread for matching events.
pub type EventHandler = Box<dyn Fn(&LimiterEvent) + Send + Sync>;

struct Subscription {
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Fan-out point between the limiter and its subscribers.
///
/// Publication is a subscriber-count check plus one unbounded-channel
/// send. The dispatcher thread is spawned lazily on the first
/// subscription and exits when the owning limiter (the only sender) is
/// dropped.
pub(crate) struct EventPublisher {
    handlers: Arc<RwLock<Vec<Subscription>>>,
    subscriber_count: AtomicUsize,
    sender: Sender<LimiterEvent>,
    receiver: Mutex<Option<Receiver<LimiterEvent>>>,
    dispatcher_started: AtomicBool,
}

impl EventPublisher {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            subscriber_count: AtomicUsize::new(0),
            sender,
            receiver: Mutex::new(Some(receiver)),
            dispatcher_started: AtomicBool::new(false),
        }
    }

    /// Whether any handler is registered. The hot path consults this
    /// before building an event, so unobserved limiters pay nothing.
    pub(crate) fn has_subscribers(&self) -> bool {
        self.subscriber_count.load(Ordering::Acquire) > 0
    }

    /// Registers a handler for one event kind, or for all kinds when
    /// `kind` is `None`.
    pub(crate) fn subscribe(&self, kind: Option<EventKind>, handler: EventHandler) {
        {
            let mut handlers = self
                .handlers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.push(Subscription { kind, handler });
        }
        self.subscriber_count.fetch_add(1, Ordering::AcqRel);
        self.ensure_dispatcher();
    }

    /// Enqueues an event for asynchronous delivery. Never blocks; a
    /// drop of the dispatcher side (only possible during teardown) is
    /// silently ignored.
    pub(crate) fn publish(&self, event: LimiterEvent) {
        if !self.has_subscribers() {
            return;
        }
        let _ = self.sender.send(event);
    }

    fn ensure_dispatcher(&self) {
        if self.dispatcher_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(receiver) = receiver else {
            return;
        };
        let handlers = Arc::clone(&self.handlers);
        thread::spawn(move || dispatch_loop(receiver, handlers));
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field(
                "subscribers",
                &self.subscriber_count.load(Ordering::Relaxed),
            )
            .field(
                "dispatcher_started",
                &self.dispatcher_started.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Runs until the channel disconnects, i.e. until the owning limiter is
/// dropped. Handler panics are contained here and never reach the
/// limiter's control flow.
fn dispatch_loop(receiver: Receiver<LimiterEvent>, handlers: Arc<RwLock<Vec<Subscription>>>) {
    for event in receiver.iter() {
        let subscriptions = handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscription in subscriptions
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == event.kind()))
        {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(&event)));
            if outcome.is_err() {
                warn!(
                    limiter = event.limiter_name(),
                    kind = ?event.kind(),
                    "event handler panicked; fault contained"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn success(name: &str, permits: u32) -> LimiterEvent {
        LimiterEvent::Success {
            name: Arc::from(name),
            permits,
        }
    }

    #[test]
    fn event_accessors() {
        let event = success("api", 3);
        assert_eq!(event.kind(), EventKind::Success);
        assert_eq!(event.limiter_name(), "api");

        let drained = LimiterEvent::Drained {
            name: Arc::from("api"),
            permits_discarded: 7,
        };
        assert_eq!(drained.kind(), EventKind::Drained);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let publisher = EventPublisher::new();
        assert!(!publisher.has_subscribers());
        // Nothing to assert beyond "does not block or panic".
        publisher.publish(success("quiet", 1));
    }

    #[test]
    fn subscribed_handlers_receive_matching_events() {
        let publisher = EventPublisher::new();
        let successes = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&successes);
        publisher.subscribe(
            Some(EventKind::Success),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&failures);
        publisher.subscribe(
            Some(EventKind::Failure),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        publisher.publish(success("api", 1));
        publisher.publish(success("api", 1));
        publisher.publish(LimiterEvent::Failure {
            name: Arc::from("api"),
            permits: 1,
        });

        wait_until(|| successes.load(Ordering::SeqCst) == 2);
        wait_until(|| failures.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn wildcard_handler_sees_every_kind() {
        let publisher = EventPublisher::new();
        let seen = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&seen);
        publisher.subscribe(
            None,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        publisher.publish(success("api", 1));
        publisher.publish(LimiterEvent::Drained {
            name: Arc::from("api"),
            permits_discarded: 0,
        });

        wait_until(|| seen.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn handler_panic_does_not_stop_delivery() {
        let publisher = EventPublisher::new();
        let delivered = Arc::new(AtomicU32::new(0));

        publisher.subscribe(
            Some(EventKind::Success),
            Box::new(|_| panic!("handler exploded")),
        );
        let counter = Arc::clone(&delivered);
        publisher.subscribe(
            Some(EventKind::Success),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        publisher.publish(success("api", 1));
        publisher.publish(success("api", 1));

        wait_until(|| delivered.load(Ordering::SeqCst) == 2);
    }

    fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached within one second");
    }
}
