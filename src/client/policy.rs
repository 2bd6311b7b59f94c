//! Reconnection backoff policy

use std::time::Duration;

/// Delay before the first reconnection attempt
pub const RECONNECT_DELAY_INITIAL: Duration = Duration::from_millis(1000);

/// Factor the delay grows by after every failed attempt
pub const RECONNECT_DELAY_SCALING: f64 = 1.5;

/// Upper bound on the reconnection delay
pub const RECONNECT_DELAY_MAX: Duration = Duration::from_millis(60_000);

/// Delay to use after `current` has been waited out without success
pub fn next_delay(current: Duration) -> Duration {
    current
        .mul_f64(RECONNECT_DELAY_SCALING)
        .min(RECONNECT_DELAY_MAX)
}

/// Delay to use after a successful connection
pub fn reset_delay() -> Duration {
    RECONNECT_DELAY_INITIAL
}
