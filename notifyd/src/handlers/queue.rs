//! Queued handler execution.
//!
//! Each queued handler gets its own job name (`handler:<name>`) and its own
//! consumers sized by the handler's `concurrency`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::executor::invoke;
use super::registry::{HandlerRegistry, RegisteredHandler};
use super::{HandlerQueueConfig, HandlerResult};
use crate::notification::types::NotificationContext;
use crate::queue::{DelayConfig, Job, JobOptions, JobProcessor, JobQueue, QueuedHandlerJob};
use crate::{Error, Result};

/// Job name of the queue serving `handler`.
pub fn handler_job_name(handler: &str) -> String {
    format!("handler:{handler}")
}

/// Delay before a handler job runs, per the delay strategy.
pub fn handler_delay(delay: &DelayConfig, attempt: u32) -> Duration {
    delay.for_attempt(attempt.max(1))
}

/// Enqueues and consumes handler jobs.
pub struct HandlerQueueManager {
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
}

impl HandlerQueueManager {
    pub fn new(queue: Arc<dyn JobQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Queue one handler execution for an event.
    ///
    /// The job id is `<event_id>:<handler>`, so redelivering the same event
    /// does not duplicate a job that is still pending.
    pub async fn enqueue(
        &self,
        registered: &RegisteredHandler,
        event_type: &str,
        payload: &Value,
        context: &NotificationContext,
    ) -> Result<HandlerResult> {
        let name = registered.name();
        let config = registered.metadata.queue.clone().unwrap_or_default();

        if let Err(e) = registered
            .handler
            .before_queue(event_type, payload, context)
            .await
        {
            warn!(handler = %name, event_id = %context.event_id, error = %e, "before_queue hook failed");
        }

        let job = QueuedHandlerJob {
            event_id: context.event_id.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            correlation_id: context.correlation_id.clone(),
            attempt: context.attempt,
            created_at: Utc::now(),
            handler_name: name.to_string(),
            queue_options: config.clone(),
            metadata: context.metadata.clone(),
        };

        let options = job_options(&job, &config);
        let queued = self
            .queue
            .add(&handler_job_name(name), serde_json::to_value(&job)?, options)
            .await?;

        debug!(
            handler = %name,
            event_id = %context.event_id,
            job_id = %queued.id,
            processing = %config.processing,
            "Handler queued"
        );
        Ok(HandlerResult::queued(name, queued.id))
    }

    /// Start consumers for every queued handler.
    pub fn start(&self) -> Result<()> {
        let processor: Arc<dyn JobProcessor> = Arc::new(HandlerJobProcessor {
            registry: self.registry.clone(),
        });

        for registered in self.registry.queued_handlers() {
            let concurrency = registered
                .metadata
                .queue
                .as_ref()
                .map(|q| q.concurrency)
                .unwrap_or(1);
            self.queue.process(
                &handler_job_name(registered.name()),
                concurrency,
                processor.clone(),
            )?;
            info!(handler = %registered.name(), concurrency, "Handler queue started");
        }
        Ok(())
    }
}

fn job_options(job: &QueuedHandlerJob, config: &HandlerQueueConfig) -> JobOptions {
    JobOptions {
        job_id: Some(format!("{}:{}", job.event_id, job.handler_name)),
        priority: config.priority,
        delay: config.delay.as_ref().map(|d| handler_delay(d, job.attempt)),
        attempts: config.retry.map(|r| r.attempts).unwrap_or(1),
        backoff: config.retry.and_then(|r| r.backoff),
    }
}

/// Worker side of handler queues.
struct HandlerJobProcessor {
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl JobProcessor for HandlerJobProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let queued: QueuedHandlerJob = serde_json::from_value(job.data.clone())
            .map_err(|e| Error::validation(format!("malformed handler job {}: {e}", job.id)))?;

        let registered = self.registry.get(&queued.handler_name).ok_or_else(|| {
            Error::config(format!("handler '{}' is not registered", queued.handler_name))
        })?;

        let context = NotificationContext {
            event_id: queued.event_id,
            correlation_id: queued.correlation_id,
            event_type: queued.event_type.clone(),
            attempt: job.attempts_made + 1,
            metadata: queued.metadata,
        };

        invoke(&registered, &queued.event_type, &queued.payload, &context).await?;
        debug!(
            handler = %queued.handler_name,
            event_id = %context.event_id,
            attempt = context.attempt,
            "Queued handler completed"
        );
        Ok(())
    }
}
