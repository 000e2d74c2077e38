//! Bounded retry with exponential backoff and jitter.
//!
//! # Retry Policy
//!
//! - Attempts: `1 + max_retries`
//! - Delay before retry `k` (0-indexed):
//!   `min(initial_backoff * multiplier^k * jitter, max_backoff)`, jitter in `[0.8, 1.2]`
//! - Classification: custom predicate, else explicit allow-list, else the
//!   default (transport failures and timeouts)
//! - [`BridgeError::CircuitOpen`] is never retried, whatever the classifier says
//!
//! The async variant waits on a timer that is cancelled by a
//! [`CancellationToken`], so no retry fires after shutdown.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{BridgeError, ErrorKind};

const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

/// Custom retry classifier.
pub type RetryPredicate = Arc<dyn Fn(&BridgeError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
    retryable_kinds: Option<HashSet<ErrorKind>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("predicate", &self.predicate.is_some())
            .field("retryable_kinds", &self.retryable_kinds)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
            retryable_kinds: None,
        }
    }

    /// Classify with a custom predicate. Takes priority over an allow-list.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&BridgeError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Retry exactly these error kinds.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, error: &BridgeError) -> bool {
        if error.kind() == ErrorKind::CircuitOpen {
            return false;
        }
        if let Some(ref predicate) = self.predicate {
            return predicate(error);
        }
        if let Some(ref kinds) = self.retryable_kinds {
            return kinds.contains(&error.kind());
        }
        matches!(error.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }

    /// Backoff before retry `attempt` (0-indexed), jittered.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.backoff_with_jitter(attempt, jitter)
    }

    fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.config.initial_backoff.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent)
            * jitter;
        let capped = base.min(self.config.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.config.max_backoff
        }
    }

    fn should_retry(&self, attempt: u32, error: &BridgeError) -> bool {
        attempt < self.config.max_retries && self.is_retryable(error)
    }

    /// Run `operation`, retrying on the calling thread. Blocks during backoff.
    pub fn execute<T, F>(&self, mut operation: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Result<T, BridgeError>,
    {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis(),
                        "Operation failed, retrying"
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        tracing::error!(error = %e, attempts = attempt + 1, "Operation failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run `operation`, scheduling retries on the tokio timer.
    ///
    /// A cancelled `shutdown` token aborts a pending backoff with
    /// [`BridgeError::Cancelled`].
    pub async fn execute_async<T, F, Fut>(
        &self,
        shutdown: &CancellationToken,
        mut operation: F,
    ) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis(),
                        "Request failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::debug!(attempt = attempt + 1, "Retry abandoned by shutdown");
                            return Err(BridgeError::cancelled("retry abandoned by shutdown"));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        tracing::error!(error = %e, attempts = attempt + 1, "Request failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        })
    }

    #[test]
    fn zero_retries_makes_one_attempt() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(0).execute(|| {
            calls.set(calls.get() + 1);
            Err(BridgeError::transport("down"))
        });

        assert!(matches!(result, Err(BridgeError::Transport { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_until_success() {
        let calls = Cell::new(0);
        let result = fast(3).execute(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(BridgeError::Timeout(Duration::from_millis(10)))
            } else {
                Ok("ok")
            }
        });

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(2).execute(|| {
            calls.set(calls.get() + 1);
            Err(BridgeError::transport(format!("attempt {}", calls.get())))
        });

        assert_eq!(calls.get(), 3);
        assert_eq!(
            result.unwrap_err().to_string(),
            "transport error: attempt 3"
        );
    }

    #[test]
    fn non_retryable_fails_immediately() {
        for err in [
            BridgeError::CircuitOpen,
            BridgeError::Server("nope".into()),
            BridgeError::protocol("garbage"),
        ] {
            let calls = Cell::new(0);
            let mut err = Some(err);
            let _: Result<(), _> = fast(5).execute(|| {
                calls.set(calls.get() + 1);
                Err(err.take().unwrap_or(BridgeError::NotRunning))
            });
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn predicate_takes_priority_over_allow_list() {
        let policy = fast(1)
            .with_retryable_kinds([ErrorKind::Transport])
            .with_predicate(|e| matches!(e, BridgeError::Server(_)));

        assert!(policy.is_retryable(&BridgeError::Server("busy".into())));
        assert!(!policy.is_retryable(&BridgeError::transport("down")));
    }

    #[test]
    fn allow_list_replaces_defaults() {
        let policy = fast(1).with_retryable_kinds([ErrorKind::Protocol]);
        assert!(policy.is_retryable(&BridgeError::protocol("bad frame")));
        assert!(!policy.is_retryable(&BridgeError::Timeout(Duration::ZERO)));
    }

    #[test]
    fn circuit_open_is_never_retryable() {
        let policy = fast(1)
            .with_predicate(|_| true)
            .with_retryable_kinds([ErrorKind::CircuitOpen]);
        assert!(!policy.is_retryable(&BridgeError::CircuitOpen));
    }

    #[test]
    fn backoff_is_bounded_and_grows() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        });

        for attempt in 0..3 {
            let nominal = 100.0 * 2f64.powi(attempt as i32);
            for _ in 0..50 {
                let ms = policy.backoff(attempt).as_secs_f64() * 1000.0;
                assert!(ms <= 500.0 + 1e-6, "attempt {attempt}: {ms}ms over cap");
                assert!(ms >= nominal * JITTER_MIN - 1e-6);
                assert!(ms <= (nominal * JITTER_MAX).min(500.0) + 1e-6);
            }
        }

        // Without jitter the schedule is non-decreasing and capped.
        let schedule: Vec<_> = (0..6).map(|k| policy.backoff_with_jitter(k, 1.0)).collect();
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(schedule[0], Duration::from_millis(100));
        assert_eq!(*schedule.last().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_survives_huge_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_with_jitter(u32::MAX, 1.2), policy.config().max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn async_retries_on_timer() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        });
        let token = CancellationToken::new();
        let calls = Cell::new(0);
        let start = tokio::time::Instant::now();

        let result = policy
            .execute_async(&token, || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(BridgeError::transport("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 1s and 2s nominal backoff, each jittered by at most 20%.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(2400), "{waited:?}");
        assert!(waited <= Duration::from_millis(3600), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retry() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_secs(60),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(60),
        });
        let token = CancellationToken::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let task = {
            let token = token.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                policy
                    .execute_async(&token, || {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        async { Err::<(), _>(BridgeError::transport("down")) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(BridgeError::Cancelled(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
