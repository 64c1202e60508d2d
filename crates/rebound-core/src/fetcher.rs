//! Resilient fetch engine.
//!
//! [`ResilientFetcher`] layers two independent retry tracks over a
//! [`Transport`]:
//!
//! ```text
//! status cycle:  pace -> BackoffPolicy[ admit -> identity -> transport ] -> status check
//!                  ^                                                          |
//!                  +------------- 403/429/503, budget left, backoff <---------+
//! ```
//!
//! Transport failures (connect, timeout) are retried by the inner
//! [`BackoffPolicy`]. Anti-bot status codes restart the whole cycle with fresh
//! pacing, a new rate-limiter admission and a new identity, on their own
//! exponential schedule.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use url::Url;

use crate::backoff::{Attempt, BackoffPolicy, uniform_duration};
use crate::config::FetchConfig;
use crate::error::{AppError, ErrorKind};
use crate::identity::IdentityProvider;
use crate::models::{FetchRequest, FetchResult, Headers};
use crate::rate_limit::RateLimiter;
use crate::traits::{Transport, TransportRequest};

/// Status codes treated as throttling/blocking rather than application errors.
pub const ANTI_BOT_STATUSES: [u16; 3] = [403, 429, 503];

pub fn is_anti_bot_status(status: u16) -> bool {
    ANTI_BOT_STATUSES.contains(&status)
}

/// Backoff schedule for anti-bot status codes:
/// `base_delay * 2^(n-1) + U(0, jitter_max)`, capped at `max_delay` before jitter.
#[derive(Debug, Clone)]
pub struct StatusBackoff {
    pub base_delay: Duration,
    pub jitter_max: Duration,
    pub max_delay: Duration,
}

impl Default for StatusBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            jitter_max: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl StatusBackoff {
    /// Jitter-free delay after the `n`-th blocked round (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(30) as i32;
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * 2f64.powi(exponent))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Events emitted by the fetcher for monitoring/logging.
#[derive(Debug, Clone)]
pub enum FetchEvent<'a> {
    Paced {
        url: &'a str,
        delay: Duration,
    },
    AttemptStarted {
        url: &'a str,
        attempt: u32,
        user_agent: &'a str,
        proxy: Option<&'a Url>,
    },
    TransportRetry {
        url: &'a str,
        attempt: u32,
        error: &'a AppError,
    },
    StatusBackoff {
        url: &'a str,
        status: u16,
        round: u32,
        delay: Duration,
    },
    Blocked {
        url: &'a str,
        status: u16,
        attempts: u32,
    },
    Completed {
        url: &'a str,
        status: u16,
        attempts: u32,
    },
}

/// Trait for receiving fetch events (decoupled logging).
pub trait FetchReporter: Send + Sync {
    fn report(&self, event: FetchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFetchReporter;

impl FetchReporter for TracingFetchReporter {
    fn report(&self, event: FetchEvent<'_>) {
        match event {
            FetchEvent::Paced { url, delay } => {
                tracing::debug!(%url, delay_ms = %delay.as_millis(), "Pacing request");
            }
            FetchEvent::AttemptStarted {
                url,
                attempt,
                user_agent,
                proxy,
            } => {
                tracing::debug!(
                    %url,
                    attempt,
                    %user_agent,
                    proxy = proxy.map(Url::as_str).unwrap_or("direct"),
                    "Sending request"
                );
            }
            FetchEvent::TransportRetry {
                url,
                attempt,
                error,
            } => {
                tracing::warn!(%url, attempt, %error, "Transport failure, backing off");
            }
            FetchEvent::StatusBackoff {
                url,
                status,
                round,
                delay,
            } => {
                tracing::warn!(
                    %url,
                    status,
                    round,
                    delay_ms = %delay.as_millis(),
                    "Anti-bot status, rotating identity and backing off"
                );
            }
            FetchEvent::Blocked {
                url,
                status,
                attempts,
            } => {
                tracing::warn!(%url, status, attempts, "Status retry budget exhausted");
            }
            FetchEvent::Completed {
                url,
                status,
                attempts,
            } => {
                tracing::info!(%url, status, attempts, "Fetched");
            }
        }
    }
}

/// Fetches URLs through pacing, rate limiting, identity rotation and the two
/// retry tracks. Cheap to clone; clones share the limiter and identity pools.
#[derive(Clone)]
pub struct ResilientFetcher<T> {
    transport: T,
    limiter: Arc<RateLimiter>,
    identities: Arc<IdentityProvider>,
    pacing: (Duration, Duration),
    backoff: BackoffPolicy<ErrorKind>,
    status_backoff: StatusBackoff,
    reporter: Arc<dyn FetchReporter>,
}

impl<T: Transport> ResilientFetcher<T> {
    pub fn new(transport: T, limiter: Arc<RateLimiter>, identities: Arc<IdentityProvider>) -> Self {
        let defaults = FetchConfig::default();
        Self {
            transport,
            limiter,
            identities,
            pacing: defaults.pacing(),
            backoff: BackoffPolicy::new([ErrorKind::Transport]),
            status_backoff: StatusBackoff::default(),
            reporter: Arc::new(TracingFetchReporter),
        }
    }

    /// Build a fetcher wired to the process-wide limiter and identity
    /// provider, initialising them from `config` on first use.
    pub fn from_config(transport: T, config: &FetchConfig) -> Result<Self, AppError> {
        let limiter = RateLimiter::init_global(config.rate, config.burst);
        let identities = match IdentityProvider::global() {
            Some(identities) => identities,
            None => IdentityProvider::init_global(IdentityProvider::from_sources(
                config.user_agents.clone(),
                Some(config.user_agent_file.as_path()),
                &config.proxies,
            )?),
        };

        let backoff = BackoffPolicy::new([ErrorKind::Transport])
            .with_tries(config.tries)
            .with_default_timeout(Some(config.timeout));
        backoff.validate()?;

        let (min_delay, max_delay) = config.pacing();
        Ok(Self::new(transport, limiter, identities)
            .with_pacing(min_delay, max_delay)
            .with_backoff(backoff))
    }

    /// Randomised per-cycle delay window. Bounds may be given in any order.
    pub fn with_pacing(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.pacing = (min_delay.min(max_delay), min_delay.max(max_delay));
        self
    }

    /// Transport-level retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy<ErrorKind>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_status_backoff(mut self, status_backoff: StatusBackoff) -> Self {
        self.status_backoff = status_backoff;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn FetchReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn identities(&self) -> &Arc<IdentityProvider> {
        &self.identities
    }

    /// Fetch `request`, retrying transport failures and anti-bot statuses.
    ///
    /// Fails with [`AppError::Blocked`] once more than
    /// `request.status_retry_budget` status-triggered retries have been
    /// spent, with [`AppError::HttpStatus`] for any other 4xx/5xx, and with
    /// the last transport error once the backoff policy gives up.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, AppError> {
        let url = request.url.as_str();
        let attempts = AtomicU32::new(0);
        let mut round: u32 = 0;

        loop {
            round += 1;

            let pause = uniform_duration(self.pacing.0, self.pacing.1);
            if !pause.is_zero() {
                self.reporter.report(FetchEvent::Paced { url, delay: pause });
                tokio::time::sleep(pause).await;
            }

            let result = self
                .backoff
                .run_with(
                    |attempt| {
                        attempts.fetch_add(1, Ordering::Relaxed);
                        self.attempt(request, attempt)
                    },
                    |number, error: &AppError| {
                        self.reporter.report(FetchEvent::TransportRetry {
                            url,
                            attempt: number,
                            error,
                        });
                        Ok(())
                    },
                )
                .await?;

            let total = attempts.load(Ordering::Relaxed);

            if is_anti_bot_status(result.status) {
                let retries_so_far = round - 1;
                if retries_so_far > request.status_retry_budget {
                    self.reporter.report(FetchEvent::Blocked {
                        url,
                        status: result.status,
                        attempts: total,
                    });
                    return Err(AppError::Blocked {
                        result: Box::new(result),
                        attempts: total,
                    });
                }

                let delay = self.status_backoff.delay_for(round)
                    + uniform_duration(Duration::ZERO, self.status_backoff.jitter_max);
                self.reporter.report(FetchEvent::StatusBackoff {
                    url,
                    status: result.status,
                    round,
                    delay,
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            if result.is_error_status() {
                return Err(AppError::HttpStatus {
                    url: url.to_string(),
                    result: Box::new(result),
                });
            }

            self.reporter.report(FetchEvent::Completed {
                url,
                status: result.status,
                attempts: total,
            });
            return Ok(result);
        }
    }

    /// One transport attempt: admission, identity draw, round-trip.
    async fn attempt(&self, request: &FetchRequest, attempt: Attempt) -> Result<FetchResult, AppError> {
        self.limiter.admit(1.0).await?;

        let identity = self.identities.next();
        let mut headers = request.headers.clone();
        let mut identity_headers = Headers::new();
        identity_headers.insert("User-Agent", identity.user_agent.as_str());
        headers.merge_missing(&identity_headers);

        self.reporter.report(FetchEvent::AttemptStarted {
            url: &request.url,
            attempt: attempt.number,
            user_agent: &identity.user_agent,
            proxy: identity.proxy.as_ref(),
        });

        self.transport
            .send(TransportRequest {
                method: request.method,
                url: &request.url,
                query: &request.query,
                form: &request.form,
                headers: &headers,
                proxy: identity.proxy.as_ref(),
                timeout: request.timeout.or(attempt.timeout),
            })
            .await
    }
}
