//! Job queue backend contract and job envelopes.
//!
//! The execution manager and the handler queue manager only talk to
//! [`JobQueue`]; [`InMemoryJobQueue`] is the in-process backend.

pub mod memory;
pub mod result_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use memory::{InMemoryJobQueue, QueueConfig};
pub use result_store::{EventOutcome, ResultStore};

/// Job name used for deferred event dispatch.
pub const EVENT_JOB_NAME: &str = "notification-event";

/// How a delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DelayStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// A delay in milliseconds and its growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub ms: u64,
    #[serde(default)]
    pub strategy: DelayStrategy,
}

impl DelayConfig {
    pub fn fixed(ms: u64) -> Self {
        Self {
            ms,
            strategy: DelayStrategy::Fixed,
        }
    }

    pub fn exponential(ms: u64) -> Self {
        Self {
            ms,
            strategy: DelayStrategy::Exponential,
        }
    }

    /// Delay for the 1-based `attempt`.
    ///
    /// `fixed` is constant; `exponential` is `ms * 2^(attempt-1)`.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            DelayStrategy::Fixed => self.ms,
            DelayStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(63);
                self.ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Options for [`JobQueue::add`].
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Idempotency key. Adding a job whose id is still waiting or active
    /// returns the existing job.
    pub job_id: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    pub delay: Option<Duration>,
    /// Total deliveries allowed, at least 1.
    pub attempts: u32,
    /// Redelivery delay; immediate when unset.
    pub backoff: Option<DelayConfig>,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
}

/// A job held by a queue backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    /// Deliveries that already failed; 0 on first delivery.
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Option<DelayConfig>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be delivered.
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Counters reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: usize,
}

/// A job that will not be delivered again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: u64,
    pub job: Job,
    pub error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Consumer of delivered jobs.
///
/// Returning an error redelivers the job until its attempts run out; a
/// permanent error (see [`crate::Error::is_permanent`]) dead-letters it at once.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<()>;
}

/// Queue backend contract.
///
/// Delivery is at least once; consumers must tolerate redelivery of the same
/// job id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add(&self, job_name: &str, data: Value, options: JobOptions) -> Result<Job>;

    /// Start `concurrency` consumers for `job_name`.
    fn process(
        &self,
        job_name: &str,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<()>;

    async fn is_healthy(&self) -> bool;

    async fn stats(&self) -> QueueStats;

    /// Stop consumers and refuse new jobs.
    async fn close(&self);

    fn dead_letters(&self) -> Vec<DeadLetter>;
}

/// Deferred dispatch of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Deferred execution of one handler for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedHandlerJob {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub handler_name: String,
    pub queue_options: crate::handlers::HandlerQueueConfig,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}
