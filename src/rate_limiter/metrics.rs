//! Read-only observation of a limiter.
//!
//! A [`LimiterMetrics`] value is a forecast, not a ledger: the gauge
//! fields come from running the next-state function against the current
//! snapshot in observation mode, which can never reserve anything. The
//! counters are lifetime totals kept outside the atomic snapshot (they
//! are monitoring data, not accounting data, so they ride relaxed
//! atomics instead of the CAS).

use std::fmt;
use std::time::Duration;

/// A point-in-time view of one rate limiter.
///
/// Produced by [`RateLimiter::metrics`](super::core::RateLimiter::metrics).
/// Taking it does not change the limiter's state.
#[derive(Debug, Clone)]
pub struct LimiterMetrics {
    /// Permits a caller would find available right now. Negative when
    /// future permits have been reserved by waiting callers.
    pub available_permissions: i64,

    /// Estimated wait for one permit, in nanoseconds. Zero when a permit
    /// is immediately available.
    pub nanos_to_wait: u64,

    /// Estimated current cycle index.
    pub cycle: u64,

    /// Threads currently parked inside the limiter awaiting a
    /// reservation.
    pub waiting_threads: u32,

    /// Permit budget per cycle under the active configuration.
    pub limit_per_period: u32,

    /// Acquisitions granted over the limiter's lifetime.
    pub total_granted: u64,

    /// Acquisitions refused over the limiter's lifetime.
    pub total_refused: u64,

    /// Drains performed over the limiter's lifetime.
    pub total_drains: u64,
}

impl LimiterMetrics {
    /// Estimated wait for one permit as a [`Duration`].
    pub fn estimated_wait(&self) -> Duration {
        Duration::from_nanos(self.nanos_to_wait)
    }

    /// Grants plus refusals.
    pub fn total_requests(&self) -> u64 {
        self.total_granted + self.total_refused
    }

    /// Fraction of requests granted, in `0.0..=1.0`. A limiter that has
    /// seen no traffic reports `1.0`.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            1.0
        } else {
            self.total_granted as f64 / total as f64
        }
    }

    /// Fraction of requests refused, in `0.0..=1.0`.
    pub fn refusal_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    /// Whether the current cycle's budget is spent (or over-spent by
    /// reservations).
    pub fn is_saturated(&self) -> bool {
        self.available_permissions <= 0
    }

    /// Classifies the limiter's condition for dashboards and alerts.
    pub fn health_status(&self) -> HealthStatus {
        if self.refusal_rate() > 0.5 {
            HealthStatus::Critical
        } else if self.is_saturated() || self.refusal_rate() > 0.2 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl fmt::Display for LimiterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "permits {}/{} (cycle {}), wait {:?}, waiting threads {}, \
             granted {}, refused {}, drains {}",
            self.available_permissions,
            self.limit_per_period,
            self.cycle,
            self.estimated_wait(),
            self.waiting_threads,
            self.total_granted,
            self.total_refused,
            self.total_drains,
        )
    }
}

/// Three-level health classification derived from [`LimiterMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Requests are flowing and the budget has headroom.
    Healthy,
    /// The budget is spent or a noticeable share of requests is being
    /// refused; recoverable if load eases.
    Degraded,
    /// Most requests are being refused; demand durably exceeds the
    /// configured rate.
    Critical,
}

impl HealthStatus {
    /// `true` for anything other than [`HealthStatus::Healthy`].
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}
