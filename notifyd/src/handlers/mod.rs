//! Event handlers independent of channel delivery.
//!
//! Handlers subscribe to event types (or `*`), run in priority order and
//! either execute inline or go through a per-handler queue, depending on
//! their [`HandlerQueueConfig`].

pub mod audit;
pub mod executor;
pub mod queue;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notification::types::NotificationContext;
use crate::queue::DelayConfig;
use crate::{Error, Result};

pub use audit::AuditHandler;
pub use executor::HandlerExecutor;
pub use queue::HandlerQueueManager;
pub use registry::{HandlerRegistry, RegisteredHandler};

/// Subscription matching every event type.
pub const WILDCARD: &str = "*";

/// Where a handler runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HandlerProcessing {
    #[default]
    Sync,
    Async,
    Delayed,
}

/// Redelivery policy of a queued handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRetryConfig {
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Option<DelayConfig>,
}

/// Queue policy of a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerQueueConfig {
    #[serde(default)]
    pub processing: HandlerProcessing,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay: Option<DelayConfig>,
    #[serde(default)]
    pub retry: Option<HandlerRetryConfig>,
}

fn default_concurrency() -> usize {
    1
}

impl Default for HandlerQueueConfig {
    fn default() -> Self {
        Self {
            processing: HandlerProcessing::Sync,
            concurrency: default_concurrency(),
            priority: 0,
            delay: None,
            retry: None,
        }
    }
}

impl HandlerQueueConfig {
    pub fn queued(processing: HandlerProcessing) -> Self {
        Self {
            processing,
            ..Default::default()
        }
    }

    pub fn is_queued(&self) -> bool {
        self.processing != HandlerProcessing::Sync
    }
}

/// Registration data of a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerMetadata {
    pub name: String,
    pub event_types: Vec<String>,
    /// Higher runs first.
    pub priority: i32,
    #[serde(default)]
    pub queue: Option<HandlerQueueConfig>,
}

impl HandlerMetadata {
    /// Metadata as declared by the handler itself.
    pub fn from_handler(handler: &dyn Handler) -> Self {
        Self {
            name: handler.name().to_string(),
            event_types: handler.event_types(),
            priority: handler.priority(),
            queue: handler.queue_config(),
        }
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }

    pub fn is_wildcard(&self) -> bool {
        self.subscribes_to(WILDCARD)
    }

    pub fn is_queued(&self) -> bool {
        self.queue.as_ref().is_some_and(HandlerQueueConfig::is_queued)
    }
}

/// An event subscriber with arbitrary side effects.
///
/// Hook errors are logged by the executor and never fail the dispatch.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribed event types; `*` matches every event.
    fn event_types(&self) -> Vec<String>;

    fn priority(&self) -> i32 {
        0
    }

    fn queue_config(&self) -> Option<HandlerQueueConfig> {
        None
    }

    async fn execute(
        &self,
        event_type: &str,
        payload: &Value,
        context: &NotificationContext,
    ) -> Result<Value>;

    /// Decline a particular event.
    fn can_handle(&self, _event_type: &str, _payload: &Value) -> bool {
        true
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn before_queue(
        &self,
        _event_type: &str,
        _payload: &Value,
        _context: &NotificationContext,
    ) -> Result<()> {
        Ok(())
    }

    async fn after_execute(
        &self,
        _event_type: &str,
        _payload: &Value,
        _context: &NotificationContext,
        _output: &Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_error(
        &self,
        _event_type: &str,
        _payload: &Value,
        _context: &NotificationContext,
        _error: &Error,
    ) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a handler for one event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HandlerStatus {
    Completed,
    Failed,
    Queued,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub handler: String,
    pub status: HandlerStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Queue job id for `queued` results.
    #[serde(default)]
    pub job_id: Option<String>,
    pub duration_ms: u64,
}

impl HandlerResult {
    fn new(handler: impl Into<String>, status: HandlerStatus) -> Self {
        Self {
            handler: handler.into(),
            status,
            output: None,
            error: None,
            job_id: None,
            duration_ms: 0,
        }
    }

    pub fn completed(handler: impl Into<String>, output: Value, duration: Duration) -> Self {
        let mut result = Self::new(handler, HandlerStatus::Completed);
        result.output = Some(output);
        result.duration_ms = duration.as_millis() as u64;
        result
    }

    pub fn failed(handler: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        let mut result = Self::new(handler, HandlerStatus::Failed);
        result.error = Some(error.into());
        result.duration_ms = duration.as_millis() as u64;
        result
    }

    pub fn queued(handler: impl Into<String>, job_id: impl Into<String>) -> Self {
        let mut result = Self::new(handler, HandlerStatus::Queued);
        result.job_id = Some(job_id.into());
        result
    }

    pub fn skipped(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(handler, HandlerStatus::Skipped);
        result.error = Some(reason.into());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config: HandlerQueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.processing, HandlerProcessing::Sync);
        assert_eq!(config.concurrency, 1);
        assert!(!config.is_queued());

        let config: HandlerQueueConfig = serde_json::from_str(
            r#"{ "processing": "delayed", "delay": { "ms": 50, "strategy": "exponential" },
                 "retry": { "attempts": 3 } }"#,
        )
        .unwrap();
        assert!(config.is_queued());
        assert_eq!(config.delay, Some(DelayConfig::exponential(50)));
        assert_eq!(config.retry.unwrap().attempts, 3);
    }

    #[test]
    fn test_metadata_subscriptions() {
        let metadata = HandlerMetadata {
            name: "audit".to_string(),
            event_types: vec!["*".to_string()],
            priority: 0,
            queue: None,
        };
        assert!(metadata.is_wildcard());
        assert!(!metadata.subscribes_to("user.created"));
        assert!(!metadata.is_queued());
    }
}
