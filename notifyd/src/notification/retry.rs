//! Retry engine with exponential backoff and jitter.
//!
//! The delay before attempt `n + 1` is
//! `min(max_delay, initial_delay * backoff_factor^(n-1))` plus up to
//! `jitter_ratio` of that value, drawn uniformly.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::types::{NotificationContext, NotificationResult, NotificationStatus};
use crate::utils::time;
use crate::{Error, Result};

/// HTTP statuses worth retrying.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Error message fragments that indicate a transient failure.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "econnreset",
    "econnrefused",
    "etimedout",
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
];

/// Which failures a retrying call site is willing to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Retry every failure.
    #[default]
    Any,
    /// Retry only failures accepted by [`is_retryable_error`].
    Transient,
}

/// Backoff policy for retried deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound of the exponential part, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Maximum jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default)]
    pub retry_on: RetryOn,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_ratio: default_jitter_ratio(),
            retry_on: RetryOn::default(),
        }
    }
}

impl RetryPolicy {
    /// Only retry failures the classifier considers transient.
    pub fn transient_only(mut self) -> Self {
        self.retry_on = RetryOn::Transient;
        self
    }

    /// Delay before attempt `attempt + 1`, without jitter (`attempt` is 1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_factor.max(0.0).powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay before attempt `attempt + 1`, including jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jitter_ms = (base_ms as f64 * ratio * rand::random::<f64>()) as u64;
        Duration::from_millis(base_ms.saturating_add(jitter_ms))
    }

    fn allows(&self, err: &Error) -> bool {
        match self.retry_on {
            RetryOn::Any => true,
            RetryOn::Transient => is_retryable_error(err),
        }
    }

    fn allows_result(&self, result: &NotificationResult) -> bool {
        match self.retry_on {
            RetryOn::Any => true,
            RetryOn::Transient => is_retryable_result(result),
        }
    }
}

/// Whether an HTTP status code signals a transient condition.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Whether an error message looks like a transient network or rate-limit failure.
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Advisory classifier for transient failures.
pub fn is_retryable_error(err: &Error) -> bool {
    if err.is_permanent() {
        return false;
    }

    match err {
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| is_retryable_status(s.as_u16()))
        }
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
        ),
        Error::Timeout(_) | Error::Queue(_) => true,
        Error::RetryExhausted { .. } | Error::RetryAborted { .. } => false,
        other => is_retryable_message(&other.to_string()),
    }
}

/// Whether a failed delivery result is worth another attempt.
///
/// Providers can set `metadata.retryable` explicitly; otherwise the error
/// message is classified.
pub fn is_retryable_result(result: &NotificationResult) -> bool {
    if let Some(hint) = result.metadata.get("retryable").and_then(|v| v.as_bool()) {
        return hint;
    }
    result.error.as_deref().is_some_and(is_retryable_message)
}

/// Wraps fallible operations with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` up to `max_attempts` times until it returns `Ok`.
    ///
    /// Each attempt receives its own context copy with the attempt number
    /// advanced. Exhaustion yields [`Error::RetryExhausted`] with the last error.
    pub async fn execute<T, F, Fut>(
        &self,
        mut op: F,
        max_attempts: u32,
        context: &NotificationContext,
        policy: Option<&RetryPolicy>,
    ) -> Result<T>
    where
        F: FnMut(NotificationContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = policy.unwrap_or(&self.policy);
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(context.for_attempt(attempt)).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !policy.allows(&err) {
                        debug!(
                            event_id = %context.event_id,
                            attempt,
                            error = %err,
                            "Failure is not retryable"
                        );
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        return Err(Error::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        event_id = %context.event_id,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run a delivery until every returned result is accepted.
    ///
    /// A `failed` or `retrying` result counts as a failed attempt, as does an
    /// `Err`. Returned results carry the number of attempts performed; when
    /// attempts run out the last results come back marked `failed`. If the
    /// final attempt itself errored, [`Error::RetryExhausted`] is returned so
    /// the caller can synthesize a failure for its target. An error the
    /// policy refuses to retry comes back as [`Error::RetryAborted`]; both
    /// carry the number of attempts made.
    pub async fn execute_with_result<F, Fut>(
        &self,
        mut op: F,
        max_attempts: u32,
        context: &NotificationContext,
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<NotificationResult>>
    where
        F: FnMut(NotificationContext) -> Fut,
        Fut: Future<Output = Result<Vec<NotificationResult>>>,
    {
        let policy = policy.unwrap_or(&self.policy);
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = op(context.for_attempt(attempt)).await;

            let retry_allowed = match &outcome {
                Ok(results) if !results.iter().any(|r| r.status.is_failure()) => None,
                Ok(results) => Some(
                    results
                        .iter()
                        .filter(|r| r.status.is_failure())
                        .all(|r| policy.allows_result(r)),
                ),
                Err(err) => Some(policy.allows(err)),
            };
            let Some(retry_allowed) = retry_allowed else {
                return Ok(annotate(outcome.unwrap_or_default(), attempt, false));
            };

            if !retry_allowed || attempt >= max_attempts {
                return match outcome {
                    Ok(results) => Ok(annotate(results, attempt, true)),
                    Err(err) if !retry_allowed => Err(Error::RetryAborted {
                        attempts: attempt,
                        source: Box::new(err),
                    }),
                    Err(err) => Err(Error::RetryExhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    }),
                };
            }

            let delay = policy.delay_for_attempt(attempt);
            let next_retry_at = time::after(Utc::now(), delay);
            match &outcome {
                Ok(results) => {
                    for result in results.iter().filter(|r| r.status.is_failure()) {
                        warn!(
                            event_id = %context.event_id,
                            channel = %result.channel,
                            provider = %result.provider,
                            status = %NotificationStatus::Retrying,
                            attempt,
                            %next_retry_at,
                            error = result.error.as_deref().unwrap_or(""),
                            "Delivery failed, scheduling retry"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        event_id = %context.event_id,
                        status = %NotificationStatus::Retrying,
                        attempt,
                        %next_retry_at,
                        error = %err,
                        "Delivery errored, scheduling retry"
                    );
                }
            }

            sleep(delay).await;
            attempt += 1;
        }
    }
}

fn annotate(
    mut results: Vec<NotificationResult>,
    attempts: u32,
    exhausted: bool,
) -> Vec<NotificationResult> {
    for result in &mut results {
        result.attempts = attempts;
        result.next_retry_at = None;
        if exhausted && result.status.is_failure() {
            result.status = NotificationStatus::Failed;
            if result.error.is_none() {
                result.error = Some("delivery failed".to_string());
            }
        }
    }
    results
}
