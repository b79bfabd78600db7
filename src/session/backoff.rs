//! Idle backoff for the inbox poll loop.

use std::time::Duration;

/// Poll delays in milliseconds, walked one step per idle cycle.
///
/// Active conversations stay near half-second latency; a quiet inbox
/// settles at one poll every ten seconds.
pub const POLL_LADDER_MS: [u64; 19] = [
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 1_000, 1_000, 2_000, 2_000, 3_000, 4_000,
    5_000, 7_500, 10_000,
];

/// Position on [`POLL_LADDER_MS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBackoff {
    step: usize,
}

impl PollBackoff {
    /// Start at the shortest delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ladder index.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Account for a finished cycle that delivered `new_items` events.
    pub fn record(&mut self, new_items: usize) {
        if new_items > 0 {
            self.step = 0;
        } else {
            let last = POLL_LADDER_MS.len().saturating_sub(1);
            self.step = self.step.saturating_add(1).min(last);
        }
    }

    /// Delay before the next cycle.
    pub fn delay(&self) -> Duration {
        let ms = POLL_LADDER_MS
            .get(self.step)
            .or(POLL_LADDER_MS.last())
            .copied()
            .unwrap_or(10_000);
        Duration::from_millis(ms)
    }
}
