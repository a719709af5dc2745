/// Exponential reconnect delay with jitter
use rand::Rng;
use std::time::Duration;

/// Random spread applied to each delay (fraction of the delay)
const JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt; doubles from `min` up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.attempt = self.attempt.saturating_add(1);
        let base = self.min.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-JITTER..=JITTER);
        // Out-of-range products saturate to the cap
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + spread))
            .unwrap_or(self.max)
            .clamp(self.min, self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
