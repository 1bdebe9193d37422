//! Exponential reconnect delay.

use std::time::Duration;

/// Doubling delay generator, clamped to a ceiling.
///
/// [`next`](Self::next) hands out the current delay and doubles it for the
/// following call, so the first wait after construction or [`reset`](Self::reset)
/// equals the initial value.
#[derive(Debug, Clone)]
pub struct BackoffCounter {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl BackoffCounter {
    /// Create a counter. `initial` larger than `max` is clamped to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Convenience constructor for millisecond bounds.
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        )
    }

    /// Return the current delay, then double it (clamped to the ceiling) for
    /// the next call. The first call returns the initial delay.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
