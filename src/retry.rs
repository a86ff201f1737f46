//! Retry policy with exponential backoff and jitter
//!
//! Shared by webhook deliveries (per consumer) and background tasks.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest exponent applied to the base delay
const MAX_EXPONENT: u32 = 20;

/// Retry policy for a consumer or task
///
/// `max_attempts` counts the initial attempt, so `max_attempts = 3`
/// means one try plus at most two retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(alias = "base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    #[serde(alias = "max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomization applied to each delay (0.0 to 1.0, ±fraction)
    #[serde(alias = "jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed-attempt policy without jitter, handy for deterministic setups
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms: ms,
            max_delay_ms: ms.max(1),
            jitter_factor: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts_made`
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// Doubles per attempt from `base_delay_ms`, capped at `max_delay_ms`,
    /// then jittered. The jittered value is also capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.max_delay_ms);
        let jittered = apply_jitter(Duration::from_millis(capped), self.jitter_factor);
        jittered.min(Duration::from_millis(self.max_delay_ms))
    }

    /// Check the policy for nonsensical values
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be >= base_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Randomize a delay by ±`factor` to spread out retries
fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = factor.clamp(0.0, 1.0);
    let range = delay.as_secs_f64() * factor;
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}
