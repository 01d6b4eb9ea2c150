//! The immutable state snapshot and the pure next-state function.
//!
//! Time is split into cycles of `refresh_period` nanoseconds, counted from
//! the limiter's construction anchor. A snapshot records which cycle the
//! limiter last touched, how many permits remain for it, and how long the
//! most recent reserving caller has to sleep. Snapshots are never mutated:
//! the façade computes a successor with [`next_state`] and swaps the cell
//! pointer, so every reader always sees one coherent quadruple.
//!
//! `active_permissions` may go negative. A negative balance means permits
//! from future cycles have already been promised to waiting callers:
//!
//! ```text
//!     limit_per_period = 2
//!
//!     cycle N          cycle N+1        cycle N+2
//!     ├────────────────┼────────────────┼──────────→
//!     permissions  2 → -1               │
//!                  ▲   three callers took the two current
//!                  │   permits plus one from cycle N+1; the
//!                  │   third sleeps until the boundary
//! ```

use super::config::LimiterConfig;

/// One immutable snapshot of the limiter.
///
/// The whole quadruple is replaced in a single compare-and-swap; config
/// changes and permit accounting ride the same update so no thread can
/// combine a stale config with fresh permit counts.
#[derive(Debug, Clone)]
pub(crate) struct LimiterState {
    /// Configuration active at this snapshot.
    pub(crate) config: LimiterConfig,
    /// Cycle index recorded by the last update.
    pub(crate) active_cycle: u64,
    /// Permits remaining for the active cycle; negative when future
    /// permits have been reserved.
    pub(crate) active_permissions: i64,
    /// How long the most recent reserving caller must sleep.
    pub(crate) nanos_to_wait: u64,
}

impl LimiterState {
    /// The snapshot a fresh limiter starts from: cycle zero, a full
    /// permit budget, nothing to wait for.
    pub(crate) fn initial(config: LimiterConfig) -> Self {
        let permissions = i64::from(config.limit_per_period());
        Self {
            config,
            active_cycle: 0,
            active_permissions: permissions,
            nanos_to_wait: 0,
        }
    }
}

/// Computes the successor snapshot for a request of `permits` permits at
/// time `now_nanos`, given the caller's wait budget.
///
/// `timeout_nanos` is `Some(budget)` for real acquisitions and `None` for
/// observation-only reads: `None` compares below every possible wait, so
/// the reservation step can never fire and the returned snapshot is a pure
/// forecast. This is what the metrics path relies on.
///
/// The function is deterministic and side-effect-free: two threads calling
/// it with the same snapshot and the same `now_nanos` produce identical
/// results, which is what makes the optimistic CAS loop sound.
pub(crate) fn next_state(
    prev: &LimiterState,
    permits: u32,
    timeout_nanos: Option<u64>,
    now_nanos: u64,
) -> LimiterState {
    let cycle_period = prev.config.refresh_period_nanos();
    let permissions_per_cycle = i64::from(prev.config.limit_per_period());

    let current_cycle = now_nanos / cycle_period;

    let mut next_cycle = prev.active_cycle;
    let mut next_permissions = prev.active_permissions;
    if current_cycle > next_cycle {
        // Credit the skipped cycles, capped at one cycle's budget. The
        // product can exceed i64 after a long idle stretch, so the
        // accumulation is widened before the cap is applied.
        let elapsed_cycles = i128::from(current_cycle - next_cycle);
        let accumulated = elapsed_cycles * i128::from(permissions_per_cycle);
        next_cycle = current_cycle;
        next_permissions = (i128::from(next_permissions) + accumulated)
            .min(i128::from(permissions_per_cycle)) as i64;
    }

    let nanos_to_wait = nanos_to_wait_for_permission(
        permits,
        cycle_period,
        permissions_per_cycle,
        next_permissions,
        now_nanos,
        current_cycle,
    );

    reserve_permissions(prev, permits, timeout_nanos, next_cycle, next_permissions, nanos_to_wait)
}

/// How long a caller must wait until `permits` permits have accumulated.
///
/// Zero when the balance already covers the request. Otherwise the wait
/// runs to the next cycle boundary plus however many full cycles it takes
/// for the shortfall to be paid off.
fn nanos_to_wait_for_permission(
    permits: u32,
    cycle_period: u64,
    permissions_per_cycle: i64,
    available_permissions: i64,
    now_nanos: u64,
    current_cycle: u64,
) -> u64 {
    if available_permissions >= i64::from(permits) {
        return 0;
    }
    let next_cycle_starts_at = (current_cycle + 1).saturating_mul(cycle_period);
    let nanos_to_next_cycle = next_cycle_starts_at.saturating_sub(now_nanos);
    let permissions_at_next_cycle = available_permissions + permissions_per_cycle;
    let shortfall = (i64::from(permits) - permissions_at_next_cycle).max(0) as u64;
    let full_cycles_to_wait = ceil_div(shortfall, permissions_per_cycle as u64);
    full_cycles_to_wait
        .saturating_mul(cycle_period)
        .saturating_add(nanos_to_next_cycle)
}

/// Builds the successor snapshot, deducting the permits only if the
/// caller's budget covers the computed wait. An observation-only call
/// (`timeout_nanos == None`) never deducts.
fn reserve_permissions(
    prev: &LimiterState,
    permits: u32,
    timeout_nanos: Option<u64>,
    cycle: u64,
    permissions: i64,
    nanos_to_wait: u64,
) -> LimiterState {
    let can_acquire_in_time = timeout_nanos.map_or(false, |budget| budget >= nanos_to_wait);
    let permissions_with_reservation = if can_acquire_in_time {
        permissions - i64::from(permits)
    } else {
        permissions
    };
    LimiterState {
        config: prev.config.clone(),
        active_cycle: cycle,
        active_permissions: permissions_with_reservation,
        nanos_to_wait,
    }
}

/// Integer division rounded towards positive infinity. `divisor` > 0.
fn ceil_div(dividend: u64, divisor: u64) -> u64 {
    dividend.saturating_add(divisor - 1) / divisor
}
