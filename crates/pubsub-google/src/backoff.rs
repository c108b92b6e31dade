use std::time::Duration;

/// Exponential backoff between retries.
///
/// Delays grow by `factor` from `min` and are capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl Backoff {
    /// Creates a backoff doubling from `min` up to `max`.
    #[must_use]
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            factor: 2.0,
            attempt: 0,
        }
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Delay before the next attempt. Each call counts one failed attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let seconds = self.min.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        self.attempt = self.attempt.saturating_add(1);

        Duration::try_from_secs_f64(seconds).map_or(self.max, |delay| delay.min(self.max))
    }

    /// Returns to the initial delay after a success.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of failures since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}
