//! The resilient fetch engine: one logical outbound call executed with
//! bounded attempts, server-dictated pacing, and local backoff.
//!
//! The engine owns the retry envelope only. It never writes job state; the
//! worker translates the returned response or error into a queue
//! `complete`/`fail` call, consulting [`crate::classify`] for the retryable
//! verdict.
//!
//! Per attempt the engine:
//!
//! 1. waits on the [`Pacer`] hook if one is installed (a pacer error aborts
//!    the whole call),
//! 2. rebuilds the request through the [`RequestFactory`] (so credentials and
//!    signing can be refreshed between attempts) and sends it,
//! 3. returns a received response immediately unless its status is 429 or
//!    5xx, in which case it sleeps and retries while attempts remain (on the
//!    final attempt the throttled response is handed back as-is for the
//!    caller to inspect),
//! 4. honors a `Retry-After` header exactly (integer seconds or HTTP date,
//!    clamped to non-negative) and otherwise sleeps
//!    `base_delay * attempt + jitter(0..200ms)`.
//!
//! Transport errors are retried the same way, except a timeout or a
//! last-attempt failure is returned immediately. Cancellation short-circuits
//! every sleep and wait.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    Client, RequestBuilder, Response, StatusCode,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const JITTER_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,
    /// The pacing hook refused a permit; the call was aborted before the
    /// attempt was issued.
    #[error(transparent)]
    Aborted(#[from] PacerError),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
#[error("rate limiter aborted the fetch: {0}")]
pub struct PacerError(pub String);

/// The caller-supplied rate-limiter hook, consulted before every attempt.
///
/// Implementations must be safe to share between concurrent logical calls.
#[async_trait]
pub trait Pacer: Send + Sync {
    /// Blocks until the next permit is available, or returns an error to
    /// abort the whole logical call.
    async fn acquire(&self, attempt: u32) -> Result<(), PacerError>;
}

/// Builds the request for a single attempt.
///
/// Invoked fresh per attempt: token refresh and request signing belong here,
/// not in the engine.
pub trait RequestFactory: Send + Sync {
    fn build(&self, client: &Client) -> RequestBuilder;
}

impl<F> RequestFactory for F
where
    F: Fn(&Client) -> RequestBuilder + Send + Sync,
{
    fn build(&self, client: &Client) -> RequestBuilder {
        self(client)
    }
}

/// What a single attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Response(StatusCode),
    Transport(String),
}

/// Telemetry for one fetch attempt, reported through [`AttemptObserver`].
#[derive(Debug, Clone)]
pub struct AttemptOutcome<'a> {
    /// 1-based attempt index.
    pub attempt: u32,
    pub target: &'a str,
    pub result: AttemptResult,
    /// The wait imposed before the next attempt; zero when the call ends
    /// with this attempt.
    pub wait: Duration,
}

/// Receives an [`AttemptOutcome`] after every attempt.
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, outcome: &AttemptOutcome<'_>);
}

/// Default observer: emits each outcome as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl AttemptObserver for TracingObserver {
    fn on_attempt(&self, outcome: &AttemptOutcome<'_>) {
        match &outcome.result {
            AttemptResult::Response(status) => tracing::debug!(
                target_entity = outcome.target,
                attempt = outcome.attempt,
                %status,
                wait_ms = outcome.wait.as_millis() as u64,
                "fetch attempt finished"
            ),
            AttemptResult::Transport(error) => tracing::warn!(
                target_entity = outcome.target,
                attempt = outcome.attempt,
                error,
                wait_ms = outcome.wait.as_millis() as u64,
                "fetch attempt failed in transport"
            ),
        }
    }
}

/// Executes logical outbound calls with bounded retries.
///
/// Cheap to clone; safe to share across workers. Attempts within one call
/// run sequentially, and concurrent calls share nothing mutable beyond the
/// installed [`Pacer`].
#[derive(Clone)]
pub struct FetchEngine {
    client: Client,
    max_attempts: u32,
    base_delay: Duration,
    pacer: Option<Arc<dyn Pacer>>,
    observer: Option<Arc<dyn AttemptObserver>>,
}

impl FetchEngine {
    /// Creates an engine around an existing client.
    ///
    /// `max_attempts` below 1 is clamped to 1: there is always at least one
    /// try.
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            pacer: None,
            observer: None,
        }
    }

    /// Creates an engine with its own client, applying the configured
    /// per-call timeout.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout().min(Duration::from_secs(10)))
            .build()?;
        Ok(Self::new(client, config))
    }

    /// Installs the rate-limiter pacing hook.
    pub fn with_pacer(mut self, pacer: impl Pacer + 'static) -> Self {
        self.pacer = Some(Arc::new(pacer));
        self
    }

    /// Installs the attempt telemetry observer.
    pub fn with_observer(mut self, observer: impl AttemptObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Executes one logical call against `target`.
    ///
    /// A 429/5xx received on the final attempt is returned as an `Ok`
    /// response for the caller to classify; only transport-level exhaustion
    /// is an error.
    pub async fn execute<F>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        factory: &F,
    ) -> Result<Response, FetchError>
    where
        F: RequestFactory + ?Sized,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Some(pacer) = &self.pacer {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    permit = pacer.acquire(attempt) => permit?,
                }
            }

            let request = factory.build(&self.client);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = request.send() => result,
            };
            let last = attempt >= self.max_attempts;

            match result {
                Err(error) => {
                    if last || error.is_timeout() {
                        self.observe(attempt, target, AttemptResult::Transport(error.to_string()));
                        return Err(error.into());
                    }
                    let wait = self.backoff_delay(attempt);
                    self.observe_wait(
                        attempt,
                        target,
                        AttemptResult::Transport(error.to_string()),
                        wait,
                    );
                    tracing::debug!(
                        target_entity = target,
                        attempt,
                        error = %error,
                        "transport error, retrying"
                    );
                    self.sleep(cancel, wait).await?;
                }
                Ok(response) => {
                    let status = response.status();
                    if !throttled(status) {
                        self.observe(attempt, target, AttemptResult::Response(status));
                        return Ok(response);
                    }
                    if last {
                        self.observe(attempt, target, AttemptResult::Response(status));
                        return Ok(response);
                    }
                    // Server pacing hints win over local backoff.
                    let wait = retry_after(response.headers())
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    self.observe_wait(attempt, target, AttemptResult::Response(status), wait);
                    self.sleep(cancel, wait).await?;
                }
            }
            attempt += 1;
        }
    }

    /// Linear backoff with a small random jitter. Bounded by `max_attempts`,
    /// so the worst case is deterministic.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        self.base_delay * attempt + Duration::from_millis(jitter)
    }

    async fn sleep(&self, cancel: &CancellationToken, wait: Duration) -> Result<(), FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    fn observe(&self, attempt: u32, target: &str, result: AttemptResult) {
        self.observe_wait(attempt, target, result, Duration::ZERO);
    }

    fn observe_wait(&self, attempt: u32, target: &str, result: AttemptResult, wait: Duration) {
        if let Some(observer) = &self.observer {
            observer.on_attempt(&AttemptOutcome {
                attempt,
                target,
                result,
                wait,
            });
        }
    }
}

fn throttled(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parses a `Retry-After` header as integer seconds or as an HTTP date,
/// clamping past dates to zero.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(Duration::from_secs(seconds.max(0) as u64));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod test {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn max_attempts_is_clamped_to_at_least_one() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        let engine = FetchEngine::new(Client::new(), &config);
        assert_eq!(engine.max_attempts, 1);
    }

    #[test]
    fn retry_after_parses_integer_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_negative_seconds_clamps_to_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("-3"));
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_parses_http_dates() {
        let future = (Utc::now() + chrono::TimeDelta::seconds(30)).to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&future).unwrap());
        let wait = retry_after(&headers).unwrap();
        assert!(wait > Duration::from_secs(25));
        assert!(wait <= Duration::from_secs(30));
    }

    #[test]
    fn retry_after_past_dates_clamp_to_zero() {
        let past = (Utc::now() - chrono::TimeDelta::minutes(5)).to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&past).unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_garbage_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soonish"));
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn backoff_is_linear_in_the_attempt_with_bounded_jitter() {
        let config = Config {
            base_delay_ms: 100,
            ..Config::default()
        };
        let engine = FetchEngine::new(Client::new(), &config);
        for attempt in 1..5 {
            let wait = engine.backoff_delay(attempt);
            assert!(wait >= Duration::from_millis(100) * attempt);
            assert!(wait < Duration::from_millis(100) * attempt + Duration::from_millis(JITTER_MS));
        }
    }

    #[test]
    fn throttled_statuses() {
        assert!(throttled(StatusCode::TOO_MANY_REQUESTS));
        assert!(throttled(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(throttled(StatusCode::BAD_GATEWAY));
        assert!(!throttled(StatusCode::OK));
        assert!(!throttled(StatusCode::NOT_FOUND));
        assert!(!throttled(StatusCode::UNAUTHORIZED));
    }
}
