use std::{collections::BTreeSet, future::Future, time::Duration};

use tracing::{debug, warn};

use crate::error::ApiError;

/// Statuses retried by default: request-timeout, rate-limited and transient 5xx.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Retry budget for read-only calls.
///
/// Mutating calls are never handed to the retry engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    retryable_statuses: BTreeSet<u16>,
    honor_retry_after: bool,
}

impl RetryPolicy {
    /// `max_attempts` counts the initial call; values below 1 are treated as 1.
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            honor_retry_after: false,
        }
    }

    /// Let a longer server `Retry-After` hint stretch the computed delay.
    /// Off by default: delays are pure exponential unless this is enabled.
    pub fn honor_retry_after(mut self, enabled: bool) -> Self {
        self.honor_retry_after = enabled;
        self
    }

    pub fn honors_retry_after(&self) -> bool {
        self.honor_retry_after
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn retryable_statuses(&self) -> &BTreeSet<u16> {
        &self.retryable_statuses
    }

    /// Delay before retry number `attempt` (zero-indexed): `base * 2^attempt`.
    ///
    /// The server hint only counts when [`RetryPolicy::honor_retry_after`]
    /// is enabled, and then only when it is longer.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let multiplier = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms
            .filter(|_| self.honor_retry_after)
            .unwrap_or(0);
        Duration::from_millis(calculated.max(hinted))
    }

    /// Network failures are always retryable; HTTP failures only when listed.
    pub fn is_retryable(&self, err: &ApiError) -> bool {
        match err.status {
            Some(status) => self.retryable_statuses.contains(&status),
            None => err.is_network(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1_000)
    }
}

/// Run `producer` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned on exhaustion.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut producer: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempts: u32 = 0;
    loop {
        let err = match producer().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempts = attempts.saturating_add(1);

        if !policy.is_retryable(&err) {
            debug!(code = %err.code, status = ?err.status, "error is not retryable");
            return Err(err);
        }
        if attempts >= policy.max_attempts {
            warn!(attempts, code = %err.code, status = ?err.status, "retry budget exhausted");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempts - 1, err.retry_after_ms);
        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            status = ?err.status,
            "retrying request"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::new(4, 1_000);
        assert_eq!(policy.delay_for_attempt(0, None), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_millis(4_000));
    }

    #[test]
    fn retry_after_hint_is_ignored_by_default() {
        let policy = RetryPolicy::new(3, 500);
        assert!(!policy.honors_retry_after());
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_enabled_and_larger() {
        let policy = RetryPolicy::new(3, 500).honor_retry_after(true);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
        assert_eq!(policy.delay_for_attempt(1, Some(10)), Duration::from_millis(1_000));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::new(3, 1_000);
        assert_eq!(
            policy.delay_for_attempt(200, None),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn classifies_retryable_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&ApiError::network("refused")));
        assert!(policy.is_retryable(&ApiError::http(503, "busy")));
        assert!(policy.is_retryable(&ApiError::http(429, "slow")));
        assert!(!policy.is_retryable(&ApiError::http(404, "missing")));
        assert!(!policy.is_retryable(&ApiError::parse("bad json")));

        let narrow = RetryPolicy::default().with_retryable_statuses([503]);
        assert!(!narrow.is_retryable(&ApiError::http(500, "boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_exponentially_between_attempts() {
        let policy = RetryPolicy::new(4, 1_000);
        let started = Instant::now();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let calls_clone = calls.clone();
        let result: Result<(), ApiError> = run_with_retry(&policy, move || {
            calls_clone
                .lock()
                .expect("lock")
                .push(started.elapsed().as_millis() as u64);
            async { Err(ApiError::http(503, "busy")) }
        })
        .await;

        let err = result.expect_err("all attempts fail");
        assert_eq!(err.status, Some(503));
        assert_eq!(*calls.lock().expect("lock"), vec![0, 1_000, 3_000, 7_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_does_not_stretch_default_backoff() {
        let policy = RetryPolicy::new(3, 1_000);
        let started = Instant::now();
        let mut calls = 0;

        let result = run_with_retry(&policy, || {
            calls += 1;
            let outcome = if calls == 1 {
                Err(ApiError::http(429, "slow down").with_retry_after(Duration::from_secs(60)))
            } else {
                Ok("ok")
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.expect("second attempt succeeds"), "ok");
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_without_delay() {
        let policy = RetryPolicy::new(5, 1_000);
        let started = Instant::now();
        let mut calls = 0;

        let result: Result<(), ApiError> = run_with_retry(&policy, || {
            calls += 1;
            async { Err(ApiError::http(404, "no such model")) }
        })
        .await;

        assert_eq!(result.expect_err("must fail").status, Some(404));
        assert_eq!(calls, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_network_failure() {
        let policy = RetryPolicy::new(3, 100);
        let mut calls = 0;

        let result = run_with_retry(&policy, || {
            calls += 1;
            let outcome = if calls < 3 {
                Err(ApiError::network("reset"))
            } else {
                Ok("ok")
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), "ok");
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_allows_one_call() {
        assert_eq!(RetryPolicy::new(0, 10).max_attempts(), 1);
    }
}
