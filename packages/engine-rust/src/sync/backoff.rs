//! Reconnect delay schedule.

use std::time::Duration;

/// Ordered reconnect delays; the index clamps at the last entry.
const DELAYS: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// Tracks how long to wait before the next connection attempt.
///
/// Each failed attempt advances the schedule; a completed handshake resets it
/// so the next disconnect retries quickly again.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    index: usize,
}

impl ReconnectBackoff {
    /// Creates a backoff at the start of the schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delay for the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = DELAYS[self.index.min(DELAYS.len() - 1)];
        self.index = (self.index + 1).min(DELAYS.len() - 1);
        delay
    }

    /// Resets to the start of the schedule.
    pub fn reset(&mut self) {
        self.index = 0;
    }
}
