//! Reconnect policy
//!
//! Pure mapping from a reconnect attempt to a delay or a give-up signal.
//! Consulted only by the session actor; swapping the implementation never
//! touches session logic.

use std::time::Duration;

use rand::Rng;

/// Context for one reconnect decision. Discarded once a connection
/// attempt succeeds.
#[derive(Debug, Clone)]
pub struct ReconnectContext {
    /// Zero-based attempt counter since the last good connection
    pub attempt: u32,
    /// Elapsed time since the last good connection
    pub elapsed: Duration,
    /// Why the last connection was lost
    pub reason: String,
    /// Server URL being retried
    pub url: String,
}

/// Maps a retry attempt to a delay, or `None` to give up.
///
/// Implementations must be pure apart from randomness: no I/O, no shared
/// state.
pub trait ReconnectPolicy: Send + Sync {
    fn next_delay(&self, cx: &ReconnectContext) -> Option<Duration>;
}

/// Default schedule: immediate first attempt, then geometrically increasing
/// delays up to a cap, with bounded random jitter from the third attempt on
/// so many clients losing the same server don't retry in lockstep.
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
    /// Base delay unit for the second attempt
    pub base: Duration,
    /// Total attempt budget; `next_delay` returns `None` at this count
    pub max_attempts: u32,
    /// Upper bound on the computed delay before jitter
    pub max_delay: Duration,
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(300),
            max_attempts: 10,
            max_delay: Duration::from_secs(7),
        }
    }
}

impl DefaultReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32, max_delay: Duration) -> Self {
        Self {
            base,
            max_attempts,
            max_delay,
        }
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn next_delay(&self, cx: &ReconnectContext) -> Option<Duration> {
        if cx.attempt >= self.max_attempts {
            return None;
        }
        let delay = match cx.attempt {
            0 => Duration::ZERO,
            1 => self.base,
            n => {
                // Shift capped so the multiplier can't overflow u32
                let factor = 1u32 << (n - 1).min(16);
                let exp = self.base.saturating_mul(factor).min(self.max_delay);
                let jitter = exp.mul_f64(rand::thread_rng().gen_range(0.0..0.3));
                exp + jitter
            }
        };
        Some(delay)
    }
}
