//! Reconnect Delay Policy

use rand::Rng;
use std::time::Duration;

/// Floor for every computed delay
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);

/// How long to wait before the next reconnect attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Constant delay between attempts
    Fixed(Duration),
    /// `base * 2^failures`, capped at `max`, spread by ±`jitter` (fraction, 0.0-1.0)
    Exponential {
        base: Duration,
        max: Duration,
        jitter: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after `failures` consecutive failed or dropped connections (0-based)
    pub fn delay(&self, failures: u32) -> Duration {
        self.delay_with(failures, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        self.raw_delay(failures, rng).max(MIN_RECONNECT_DELAY)
    }

    fn raw_delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { base, max, jitter } => {
                // 2^20 already dwarfs any sane cap
                let factor = 1u32 << failures.min(20);
                let raw = base.saturating_mul(factor).min(max);

                let jitter = jitter.clamp(0.0, 1.0);
                if jitter == 0.0 {
                    return raw;
                }
                let spread = rng.gen_range(1.0 - jitter..=1.0 + jitter);
                raw.mul_f64(spread).min(max)
            }
        }
    }
}
