use rand::Rng;
use std::time::Duration;

use crate::config::Config;

/// Reconnect delay policy: `initial * multiplier^n`, capped, with optional
/// proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Fraction in `[0, 1]`; each delay is scaled by a random factor in `[1 - j, 1 + j]`.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Fixed delay, no growth, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            cap: delay,
            jitter: 0.0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let initial = Duration::from_secs(config.backoff_secs);
        Self {
            initial,
            multiplier: 2.0,
            cap: Duration::from_secs(config.backoff_cap_secs).max(initial),
            jitter: config.backoff_jitter.clamp(0.0, 1.0),
        }
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Per-connection retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.initial.as_secs_f64() * self.policy.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.policy.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let factor = if self.policy.jitter > 0.0 {
            let j = self.policy.jitter;
            rand::thread_rng().gen_range((1.0 - j)..=(1.0 + j))
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
