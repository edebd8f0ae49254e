//! Back-off and replay of rate-limited requests.
//!
//! The pipeline never retries on its own. [`Replay429Interceptor`] is an
//! optional response interceptor that waits and asks for a replay when the
//! server answers `429 Too Many Requests`. When its replays are used up the
//! 429 reaches the classifier and surfaces as
//! [`ErrorKind::TooManyRequests`](crate::ErrorKind::TooManyRequests).

use crate::interceptor::{ResponseAction, ResponseContext, ResponseInterceptor};
use crate::rate_limit::retry_after;
use crate::Result;
use async_trait::async_trait;
use http::StatusCode;
use rand::Rng;
use std::time::Duration;

/// Upper bound on any server-requested wait.
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(60 * 60);

/// How long to wait between replays of a rate-limited request.
///
/// # Examples
///
/// ```
/// use couchwire::BackoffPolicy;
/// use std::time::Duration;
///
/// // 250ms, 500ms, 1s
/// let policy = BackoffPolicy::default();
/// assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(250)));
/// assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(1)));
/// assert_eq!(policy.delay_for_attempt(4), None);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// The delay before the first replay.
    pub initial_delay: Duration,
    /// The maximum number of replays.
    pub max_replays: usize,
    /// Whether a `Retry-After` header overrides the computed delay.
    pub prefer_retry_after: bool,
    /// Whether to add random jitter to computed delays.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_replays: 3,
            prefer_retry_after: true,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay before the given replay, or `None` once replays are
    /// exhausted.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The replay number (1-indexed, so 1 = first replay)
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_replays {
            return None;
        }

        // initial_delay * 2^(attempt - 1)
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1) as u32);
        let delay = self
            .initial_delay
            .saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));

        if self.jitter {
            // Random value between 50% and 100% of the delay
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            Some(delay.mul_f64(jitter_factor))
        } else {
            Some(delay)
        }
    }
}

/// Per-call count of 429 replays.
#[derive(Clone, Copy, Default)]
struct TooManyRequestsReplays(usize);

/// Replays requests answered with `429 Too Many Requests` after a back-off.
#[derive(Debug, Clone, Default)]
pub struct Replay429Interceptor {
    policy: BackoffPolicy,
}

impl Replay429Interceptor {
    /// Creates the interceptor with the given policy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[async_trait]
impl ResponseInterceptor for Replay429Interceptor {
    async fn intercept_response(
        &self,
        context: &mut ResponseContext<'_>,
    ) -> Result<ResponseAction> {
        if context.exchange.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(ResponseAction::Proceed);
        }

        let replays = context
            .extensions
            .get::<TooManyRequestsReplays>()
            .copied()
            .unwrap_or_default()
            .0
            + 1;
        let Some(mut delay) = self.policy.delay_for_attempt(replays) else {
            tracing::debug!(replays = replays - 1, "No 429 replays left");
            return Ok(ResponseAction::Proceed);
        };

        if self.policy.prefer_retry_after {
            if let Some(requested) = retry_after(context.exchange.headers()) {
                if requested > RETRY_AFTER_CAP {
                    tracing::error!(
                        retry_after_secs = requested.as_secs(),
                        "Server specified Retry-After in excess of one hour, capping"
                    );
                }
                delay = requested.min(RETRY_AFTER_CAP);
            }
        }
        context.extensions.insert(TooManyRequestsReplays(replays));

        let error = context
            .exchange
            .error_body()
            .await
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        tracing::warn!(
            delay_ms = delay.as_millis(),
            attempt = context.attempt,
            error = %error,
            "Too many requests; backing off before replay"
        );

        tokio::time::sleep(delay).await;
        Ok(ResponseAction::Replay)
    }
}
