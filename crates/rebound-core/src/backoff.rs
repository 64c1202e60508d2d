//! Generic retry with exponential backoff and jitter.
//!
//! [`BackoffPolicy`] retries any async operation whose failures can be
//! classified through [`Classify`]. Only failures whose kind is listed in
//! `retry_on` are retried; everything else propagates on first sight.
//!
//! ```text
//! attempt 1 --fail--> sleep(base + jitter) --> attempt 2 --fail--> sleep(min(base*f, max) + jitter) --> ...
//! ```
//!
//! The same engine wraps transport calls in the fetcher and can wrap any
//! other fallible call (database procedures, file uploads) with its own kind
//! type.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, ErrorKind};

/// Error type returned by `on_backoff` hooks. Always swallowed.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Maps a failure onto the kind vocabulary a [`BackoffPolicy`] retries on.
pub trait Classify {
    type Kind: PartialEq;

    fn kind(&self) -> Self::Kind;
}

impl Classify for AppError {
    type Kind = ErrorKind;

    fn kind(&self) -> ErrorKind {
        AppError::kind(self)
    }
}

/// Per-attempt parameters handed to the wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt counter.
    pub number: u32,
    /// Timeout the operation should apply when the caller did not set one.
    pub timeout: Option<Duration>,
}

/// Retry policy: bounded attempts with exponentially growing, capped delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy<K> {
    /// Maximum attempts, including the first one (>= 1).
    pub tries: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt (>= 1).
    pub backoff_factor: f64,
    /// Upper bound for the delay, before jitter.
    pub max_delay: Duration,
    /// Random extra delay, uniform in `[0, jitter_max]`.
    pub jitter_max: Duration,
    /// Failure kinds that trigger a retry.
    pub retry_on: Vec<K>,
    /// Injected into [`Attempt::timeout`].
    pub default_timeout: Option<Duration>,
}

impl<K> BackoffPolicy<K> {
    /// Policy retrying `retry_on` with the defaults: 5 tries, 1s base delay,
    /// factor 2, 30s cap, 300ms jitter, 15s default timeout.
    pub fn new(retry_on: impl IntoIterator<Item = K>) -> Self {
        Self {
            tries: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_max: Duration::from_millis(300),
            retry_on: retry_on.into_iter().collect(),
            default_timeout: Some(Duration::from_secs(15)),
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.tries < 1 {
            return Err(AppError::ConfigError("tries must be >= 1".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(AppError::ConfigError(format!(
                "backoff factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    fn first_delay(&self) -> Duration {
        self.base_delay.min(self.max_delay)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jitter-free delays slept between attempts (`tries - 1` entries).
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut current = self.first_delay();
        for _ in 1..self.tries.max(1) {
            delays.push(current);
            current = self.next_delay(current);
        }
        delays
    }
}

impl<K: PartialEq> BackoffPolicy<K> {
    pub fn is_retryable<E: Classify<Kind = K>>(&self, error: &E) -> bool {
        self.retry_on.contains(&error.kind())
    }

    /// Run `operation` under this policy.
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        E: Classify<Kind = K> + std::fmt::Display,
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(operation, |_, _: &E| Ok(())).await
    }

    /// Run `operation`, calling `on_backoff(attempt, &error)` before every
    /// backoff sleep. Hook errors are logged and ignored.
    ///
    /// Returns the first success, the first non-retryable failure, or the
    /// retryable failure of the final attempt, unchanged.
    pub async fn run_with<T, E, F, Fut, H>(&self, mut operation: F, mut on_backoff: H) -> Result<T, E>
    where
        E: Classify<Kind = K> + std::fmt::Display,
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(u32, &E) -> Result<(), HookError>,
    {
        let tries = self.tries.max(1);
        let mut current_delay = self.first_delay();
        let mut number = 1;

        loop {
            let attempt = Attempt {
                number,
                timeout: self.default_timeout,
            };
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.is_retryable(&error) || number >= tries {
                return Err(error);
            }

            if let Err(hook_err) = on_backoff(number, &error) {
                tracing::debug!(attempt = number, error = %hook_err, "on_backoff hook failed");
            }

            let sleep_for = current_delay + uniform_duration(Duration::ZERO, self.jitter_max);
            tracing::debug!(
                attempt = number,
                tries,
                sleep_ms = %sleep_for.as_millis(),
                error = %error,
                "Retrying after transient failure"
            );
            tokio::time::sleep(sleep_for).await;

            current_delay = self.next_delay(current_delay);
            number += 1;
        }
    }
}

/// Uniform random duration in `[lo, hi]`. Bounds may be given in any order.
pub(crate) fn uniform_duration(lo: Duration, hi: Duration) -> Duration {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if lo == hi {
        return lo;
    }
    let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    fn policy(tries: u32) -> BackoffPolicy<ErrorKind> {
        BackoffPolicy::new([ErrorKind::Transport])
            .with_tries(tries)
            .with_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_does_not_sleep() {
        let start = Instant::now();
        let value = policy(3)
            .run(|_| async { Ok::<_, AppError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(Mutex::new(0u32));
        let start = Instant::now();

        let result = policy(5)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    let mut n = calls.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        Err(AppError::NetworkError("connection reset".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(*calls.lock().unwrap(), 3);
        // 1s + 2s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_n_attempts_and_propagates_last_error() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let err = policy(4)
            .run(|attempt| {
                let attempts = attempts.clone();
                async move {
                    attempts.lock().unwrap().push(attempt.number);
                    Err::<(), _>(AppError::Timeout(Duration::from_secs(attempt.number as u64)))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(err, AppError::Timeout(d) if d == Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_propagates_immediately() {
        let calls = Arc::new(Mutex::new(0u32));
        let start = Instant::now();
        let err = policy(5)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err::<(), _>(AppError::RequestError("bad header".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::RequestError(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn on_backoff_sees_each_retry_and_its_errors_are_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();

        let err = policy(3)
            .run_with(
                |_| async { Err::<(), _>(AppError::NetworkError("refused".into())) },
                move |attempt, error: &AppError| {
                    hook_seen.lock().unwrap().push((attempt, error.to_string()));
                    Err("instrumentation exploded".into())
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NetworkError(_)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert!(seen[0].1.contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_is_injected_into_every_attempt() {
        let timeouts = Arc::new(Mutex::new(Vec::new()));
        let _ = policy(2)
            .with_default_timeout(Some(Duration::from_secs(7)))
            .run(|attempt| {
                let timeouts = timeouts.clone();
                async move {
                    timeouts.lock().unwrap().push(attempt.timeout);
                    Err::<(), _>(AppError::NetworkError("down".into()))
                }
            })
            .await;
        assert_eq!(
            *timeouts.lock().unwrap(),
            vec![Some(Duration::from_secs(7)); 2]
        );
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let p = policy(8)
            .with_base_delay(Duration::from_millis(500))
            .with_backoff_factor(3.0)
            .with_max_delay(Duration::from_secs(10));
        let delays = p.delays();
        assert_eq!(delays.len(), 7);
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_millis(1500));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn base_delay_above_cap_is_clamped() {
        let p = policy(3)
            .with_base_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(p.delays(), vec![Duration::from_secs(5); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_bounds() {
        let p = BackoffPolicy::new([ErrorKind::Transport])
            .with_tries(2)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        let start = Instant::now();
        let _ = p
            .run(|_| async { Err::<(), _>(AppError::NetworkError("x".into())) })
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(151));
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        assert!(policy(0).validate().is_err());
        assert!(policy(3).with_backoff_factor(0.5).validate().is_err());
        assert!(policy(3).with_backoff_factor(f64::NAN).validate().is_err());
        assert!(policy(1).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tries_still_runs_once() {
        let calls = Arc::new(Mutex::new(0u32));
        let _ = policy(0)
            .run(|_| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err::<(), _>(AppError::NetworkError("x".into()))
                }
            })
            .await;
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    // The policy is not tied to HTTP: any kind vocabulary works.
    #[derive(Debug, PartialEq)]
    enum DbFailure {
        Deadlock,
        ConstraintViolation,
    }

    #[derive(Debug)]
    struct DbError(DbFailure);

    impl std::fmt::Display for DbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for DbError {
        type Kind = DbFailure;

        fn kind(&self) -> DbFailure {
            match self.0 {
                DbFailure::Deadlock => DbFailure::Deadlock,
                DbFailure::ConstraintViolation => DbFailure::ConstraintViolation,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wraps_non_http_operations() {
        let calls = Arc::new(Mutex::new(0u32));
        let p = BackoffPolicy::new([DbFailure::Deadlock])
            .with_tries(3)
            .with_jitter(Duration::ZERO);

        let result: Result<(), DbError> = p
            .run(|_| {
                let calls = calls.clone();
                async move {
                    let mut n = calls.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        Err(DbError(DbFailure::Deadlock))
                    } else {
                        Err(DbError(DbFailure::ConstraintViolation))
                    }
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(DbError(DbFailure::ConstraintViolation))
        ));
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
