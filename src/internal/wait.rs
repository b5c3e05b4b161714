//! Bounded condition-variable waits shared by the pool, session map and guard.

use parking_lot::{Condvar, MutexGuard};

use crate::cancellation::{CancellationToken, CANCELLATION_POLL};
use crate::timeout::Deadline;

/// Result of one wait step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStep {
    /// Woken (or a poll slice elapsed); re-check the condition
    Woken,
    /// The deadline passed before waiting
    TimedOut,
    /// The token was cancelled before waiting
    Cancelled,
}

/// Waits once on `cond`, bounded by the deadline and polling the token.
///
/// The caller loops: check its condition, then call `wait`. Expiry and
/// cancellation are reported only before sleeping, so a wake-up that races
/// with the deadline still gets one more look at the condition.
pub(crate) fn wait<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: &Deadline,
    cancel: Option<&CancellationToken>,
) -> WaitStep {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return WaitStep::Cancelled;
    }
    if deadline.expired() {
        return WaitStep::TimedOut;
    }

    let slice = match (deadline.remaining(), cancel) {
        (Some(remaining), Some(_)) => Some(remaining.min(CANCELLATION_POLL)),
        (Some(remaining), None) => Some(remaining),
        (None, Some(_)) => Some(CANCELLATION_POLL),
        (None, None) => None,
    };

    match slice {
        Some(duration) => {
            cond.wait_for(guard, duration);
        }
        None => cond.wait(guard),
    }
    WaitStep::Woken
}
