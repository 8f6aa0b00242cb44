//! Jittered exponential backoff for live channel reconnection.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 1_000;

const GROWTH_FACTOR: f64 = 1.5;

/// Reconnect schedule: `min(base * 1.5^(attempt - 1) + jitter, max)`.
///
/// `attempt` is one-based and counts consecutive failures since the last
/// successful open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
    jitter_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
            jitter_ms: DEFAULT_RECONNECT_JITTER_MS,
            attempt: 0,
        }
    }

    /// Upper bound (exclusive) of the uniform jitter added to each delay.
    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consume one attempt and return its delay, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Some(self.delay_for(self.attempt, jitter))
    }

    /// Delay for one-based `attempt` with an explicit jitter value.
    pub fn delay_for(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let grown = self.base_delay_ms as f64 * GROWTH_FACTOR.powi(exponent);
        let grown_ms = if grown.is_finite() && grown < u64::MAX as f64 {
            grown as u64
        } else {
            u64::MAX
        };
        Duration::from_millis(grown_ms.saturating_add(jitter_ms).min(self.max_delay_ms))
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_RECONNECT_BASE_DELAY_MS,
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_half_without_jitter() {
        let mut backoff = ReconnectBackoff::default().with_jitter_ms(0);
        let delays: Vec<u64> = (0..4)
            .map(|_| backoff.next_delay().expect("budget left").as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 1_500, 2_250, 3_375]);
        assert_eq!(backoff.attempt(), 4);
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let mut backoff = ReconnectBackoff::default();
        for attempt in 1..=10_u32 {
            let delay = backoff.next_delay().expect("budget left").as_millis() as u64;
            let floor = backoff.delay_for(attempt, 0).as_millis() as u64;
            let ceiling = (1_000.0 * 1.5_f64.powi(attempt as i32 - 1) + 1_000.0).min(30_000.0);
            assert!(delay >= floor, "attempt {attempt}: {delay} < {floor}");
            assert!(delay as f64 <= ceiling, "attempt {attempt}: {delay} > {ceiling}");
        }
    }

    #[test]
    fn caps_at_max_delay() {
        let backoff = ReconnectBackoff::default();
        assert_eq!(backoff.delay_for(9, 999), Duration::from_millis(26_627));
        assert_eq!(backoff.delay_for(10, 0), Duration::from_millis(30_000));
        assert_eq!(backoff.delay_for(u32::MAX, 0), Duration::from_millis(30_000));
    }

    #[test]
    fn stops_after_max_attempts_until_reset() {
        let mut backoff = ReconnectBackoff::new(100, 1_000, 2).with_jitter_ms(0);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }
}
