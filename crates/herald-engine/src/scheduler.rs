//! Wall-clock timer plumbing.
//!
//! Long horizons never sleep straight through: the recheck ladder wakes
//! the engine periodically so every fire re-evaluates against the real
//! clock. A laptop lid closed for a week resolves as "publish time is
//! past" on the next fire and goes through missed detection instead of
//! publishing stale.

use std::collections::HashMap;

use chrono::Duration;
use tokio::task::JoinHandle;

/// What a timer fire means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-enter scheduling and pick the next tier.
    Recheck,
    /// The publish instant arrived: hand the record to the gate.
    Exact,
}

/// Tiered recheck: far-out publishes sleep in bounded steps, near ones
/// sleep exactly to the deadline.
pub fn recheck_delay(delay: Duration) -> (Duration, TimerKind) {
    if delay > Duration::days(7) {
        (Duration::hours(24), TimerKind::Recheck)
    } else if delay > Duration::days(2) {
        (Duration::hours(8), TimerKind::Recheck)
    } else if delay > Duration::days(1) {
        (Duration::hours(2), TimerKind::Recheck)
    } else {
        (delay, TimerKind::Exact)
    }
}

/// Live timers, one per slot id. Inserting for an existing id replaces
/// (and aborts) the previous timer.
#[derive(Default)]
pub struct TimerSet {
    timers: HashMap<String, JoinHandle<()>>,
}

impl TimerSet {
    pub fn insert(&mut self, id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self.timers.insert(id.to_string(), handle) {
            old.abort();
        }
    }

    /// Abort and forget the timer for `id`.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.timers.remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget without aborting — used by a fired timer removing itself.
    pub fn discard(&mut self, id: &str) {
        self.timers.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for handle in self.timers.values() {
            handle.abort();
        }
    }
}
