//! # Limiter Configuration
//!
//! Immutable configuration for a [`RateLimiter`](super::core::RateLimiter).
//!
//! A configuration is a value: once built it never changes. The runtime
//! reconfiguration operations (`change_timeout`, `change_limit_for_period`)
//! build a *new* configuration from the current one and install it through
//! the same atomic update path that handles permit accounting, so no thread
//! can ever observe half of a configuration change.
//!
//! ## The three tunables
//!
//! ```text
//!     ┌─────────────────────────────────────────────┐
//!     │ refresh_period:   how long one cycle lasts  │
//!     │ limit_per_period: permits granted per cycle │
//!     │ acquire_timeout:  how long a caller may be  │
//!     │                   asked to wait             │
//!     └─────────────────────────────────────────────┘
//! ```
//!
//! With `refresh_period = 1s` and `limit_per_period = 10` the limiter
//! sustains 10 permits per second. `acquire_timeout = 0` turns `acquire`
//! into a pure try-acquire; a larger timeout lets callers sleep into the
//! next cycles instead of being refused.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Default wait budget for acquiring callers: 5 seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cycle length: 500 nanoseconds.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_nanos(500);

/// Default permit budget per cycle: 50.
pub const DEFAULT_LIMIT_PER_PERIOD: u32 = 50;

/// Outcome of a rate-limited call, as seen by the drain-on-result predicate.
///
/// This is how callers report back what happened after they spent their
/// permit. A predicate registered via
/// [`LimiterConfigBuilder::drain_on_result`] can look at the outcome and
/// decide that the remote side has already cut us off for this period, in
/// which case the limiter throws away the rest of the period's permits.
#[derive(Debug)]
pub enum CallOutcome<'a> {
    /// The protected call completed normally.
    Ok,
    /// The protected call failed with the given error.
    Err(&'a (dyn std::error::Error + 'static)),
}

/// Predicate deciding whether a [`CallOutcome`] should drain the limiter.
pub type DrainPredicate = Arc<dyn Fn(&CallOutcome<'_>) -> bool + Send + Sync>;

/// Errors reported when building an invalid configuration.
///
/// Configuration construction is the only loud failure path in the crate;
/// every runtime condition (exhausted capacity, refused waits, cancelled
/// parks) is reported through return values instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The refresh period was shorter than one nanosecond.
    #[error("refresh period must be at least 1ns")]
    RefreshPeriodTooShort,

    /// The refresh period does not fit into 64-bit nanoseconds.
    #[error("refresh period must fit into 64-bit nanoseconds")]
    RefreshPeriodTooLong,

    /// The permit budget per cycle was zero.
    #[error("limit per period must be at least 1")]
    LimitOutOfRange,

    /// The acquire timeout does not fit into 64-bit nanoseconds.
    #[error("acquire timeout must fit into 64-bit nanoseconds")]
    AcquireTimeoutTooLong,
}

/// Immutable configuration of a rate limiter.
///
/// Build one with [`LimiterConfig::builder`]:
///
/// ```rust
/// use cyclegate::LimiterConfig;
/// use std::time::Duration;
///
/// let config = LimiterConfig::builder()
///     .refresh_period(Duration::from_millis(100))
///     .limit_per_period(10)
///     .acquire_timeout(Duration::from_millis(250))
///     .build()
///     .unwrap();
///
/// assert_eq!(config.limit_per_period(), 10);
/// ```
#[derive(Clone)]
pub struct LimiterConfig {
    refresh_period: Duration,
    limit_per_period: u32,
    acquire_timeout: Duration,
    drain_on_result: Option<DrainPredicate>,
}

impl LimiterConfig {
    /// Returns a builder seeded with the default values
    /// (5 s timeout, 500 ns refresh period, 50 permits per period).
    pub fn builder() -> LimiterConfigBuilder {
        LimiterConfigBuilder::new()
    }

    /// Returns a builder seeded with this configuration's values.
    ///
    /// This is the rebuild path used by the runtime reconfiguration
    /// operations: change one field, keep the rest.
    pub fn from_prototype(prototype: &LimiterConfig) -> LimiterConfigBuilder {
        LimiterConfigBuilder {
            refresh_period: prototype.refresh_period,
            limit_per_period: prototype.limit_per_period,
            acquire_timeout: prototype.acquire_timeout,
            drain_on_result: prototype.drain_on_result.clone(),
        }
    }

    /// Length of one refresh cycle.
    pub fn refresh_period(&self) -> Duration {
        self.refresh_period
    }

    /// Permits granted per refresh cycle.
    pub fn limit_per_period(&self) -> u32 {
        self.limit_per_period
    }

    /// Maximum time a caller may be asked to wait for a reservation.
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Whether a drain-on-result predicate is registered.
    pub fn has_drain_predicate(&self) -> bool {
        self.drain_on_result.is_some()
    }

    /// Refresh period in nanoseconds. Validated at build time to be ≥ 1
    /// and to fit into `u64`.
    pub(crate) fn refresh_period_nanos(&self) -> u64 {
        self.refresh_period.as_nanos() as u64
    }

    /// Acquire timeout in nanoseconds. Validated at build time to fit
    /// into `u64`.
    pub(crate) fn acquire_timeout_nanos(&self) -> u64 {
        self.acquire_timeout.as_nanos() as u64
    }

    /// Copy of this configuration with a different acquire timeout.
    /// The caller has already validated the new value.
    pub(crate) fn replacing_acquire_timeout(&self, acquire_timeout: Duration) -> LimiterConfig {
        LimiterConfig {
            acquire_timeout,
            ..self.clone()
        }
    }

    /// Copy of this configuration with a different permit budget.
    /// The caller has already validated the new value.
    pub(crate) fn replacing_limit_per_period(&self, limit_per_period: u32) -> LimiterConfig {
        LimiterConfig {
            limit_per_period,
            ..self.clone()
        }
    }

    /// Evaluates the drain predicate against a call outcome.
    /// Without a registered predicate the answer is always `false`.
    pub(crate) fn drain_matches(&self, outcome: &CallOutcome<'_>) -> bool {
        match &self.drain_on_result {
            Some(predicate) => predicate(outcome),
            None => false,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            refresh_period: DEFAULT_REFRESH_PERIOD,
            limit_per_period: DEFAULT_LIMIT_PER_PERIOD,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            drain_on_result: None,
        }
    }
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("refresh_period", &self.refresh_period)
            .field("limit_per_period", &self.limit_per_period)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("drain_on_result", &self.drain_on_result.is_some())
            .finish()
    }
}

/// Builder for [`LimiterConfig`].
///
/// All setters take and return the builder by value so calls chain.
/// Validation happens once, in [`build`](LimiterConfigBuilder::build).
#[derive(Clone)]
pub struct LimiterConfigBuilder {
    refresh_period: Duration,
    limit_per_period: u32,
    acquire_timeout: Duration,
    drain_on_result: Option<DrainPredicate>,
}

impl LimiterConfigBuilder {
    /// Creates a builder with the default values.
    pub fn new() -> Self {
        Self {
            refresh_period: DEFAULT_REFRESH_PERIOD,
            limit_per_period: DEFAULT_LIMIT_PER_PERIOD,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            drain_on_result: None,
        }
    }

    /// Sets the length of one refresh cycle. Must be at least 1 ns.
    pub fn refresh_period(mut self, refresh_period: Duration) -> Self {
        self.refresh_period = refresh_period;
        self
    }

    /// Sets the permit budget per cycle. Must be at least 1.
    pub fn limit_per_period(mut self, limit_per_period: u32) -> Self {
        self.limit_per_period = limit_per_period;
        self
    }

    /// Sets the maximum time a caller may be asked to wait.
    /// Zero is valid and turns `acquire` into a pure try-acquire.
    pub fn acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Registers a predicate that decides, per call outcome, whether the
    /// remaining permits of the current period should be drained.
    ///
    /// ```rust
    /// use cyclegate::{CallOutcome, LimiterConfig};
    /// use std::sync::Arc;
    ///
    /// let config = LimiterConfig::builder()
    ///     .drain_on_result(Arc::new(|outcome: &CallOutcome<'_>| {
    ///         matches!(outcome, CallOutcome::Err(_))
    ///     }))
    ///     .build()
    ///     .unwrap();
    ///
    /// assert!(config.has_drain_predicate());
    /// ```
    pub fn drain_on_result(mut self, predicate: DrainPredicate) -> Self {
        self.drain_on_result = Some(predicate);
        self
    }

    /// Validates the settings and builds the configuration.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`] for the individual conditions.
    pub fn build(self) -> Result<LimiterConfig, ConfigError> {
        if self.refresh_period < Duration::from_nanos(1) {
            return Err(ConfigError::RefreshPeriodTooShort);
        }
        if self.refresh_period.as_nanos() > u64::MAX as u128 {
            return Err(ConfigError::RefreshPeriodTooLong);
        }
        if self.limit_per_period < 1 {
            return Err(ConfigError::LimitOutOfRange);
        }
        if self.acquire_timeout.as_nanos() > u64::MAX as u128 {
            return Err(ConfigError::AcquireTimeoutTooLong);
        }
        Ok(LimiterConfig {
            refresh_period: self.refresh_period,
            limit_per_period: self.limit_per_period,
            acquire_timeout: self.acquire_timeout,
            drain_on_result: self.drain_on_result,
        })
    }
}

impl Default for LimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LimiterConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfigBuilder")
            .field("refresh_period", &self.refresh_period)
            .field("limit_per_period", &self.limit_per_period)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("drain_on_result", &self.drain_on_result.is_some())
            .finish()
    }
}
