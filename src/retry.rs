//! Reconnection policy for interrupted SSE streams.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options controlling how interrupted event streams are re-established.
///
/// The schedule is deterministic: attempt `k` (0-indexed) waits
/// `min(max_reconnection_delay, initial_reconnection_delay × grow_factor^k)`.
/// There is no jitter; callers that need it can layer their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionOptions {
    /// Delay before the first reconnection attempt
    pub initial_reconnection_delay: Duration,
    /// Upper cap applied to every computed delay
    pub max_reconnection_delay: Duration,
    /// Geometric multiplier applied per attempt (must be >= 1.0)
    pub reconnection_delay_grow_factor: f64,
    /// Number of attempts permitted before giving up; 0 disables reconnection
    pub max_retries: u32,
}

impl Default for ReconnectionOptions {
    fn default() -> Self {
        Self {
            initial_reconnection_delay: Duration::from_millis(1000),
            max_reconnection_delay: Duration::from_millis(30_000),
            reconnection_delay_grow_factor: 1.5,
            max_retries: 2,
        }
    }
}

impl ReconnectionOptions {
    /// Delay for the given 0-indexed attempt.
    ///
    /// `delay(0)` is exactly `initial_reconnection_delay`; later attempts
    /// grow geometrically and saturate at `max_reconnection_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_reconnection_delay.min(self.max_reconnection_delay);
        }

        let grown = self.initial_reconnection_delay.as_millis() as f64
            * self.reconnection_delay_grow_factor.powi(attempt as i32);
        let capped = grown.min(self.max_reconnection_delay.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }
}
