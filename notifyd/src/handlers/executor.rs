//! Runs the handlers subscribed to an event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::queue::HandlerQueueManager;
use super::registry::{HandlerRegistry, RegisteredHandler};
use super::{HandlerResult, HandlerStatus};
use crate::notification::types::NotificationContext;
use crate::{Error, Result};

/// Invoke one handler with its hooks.
///
/// Panics become errors. `after_execute` / `on_error` failures are logged and
/// do not change the outcome.
pub(crate) async fn invoke(
    registered: &RegisteredHandler,
    event_type: &str,
    payload: &Value,
    context: &NotificationContext,
) -> Result<Value> {
    let handler = &registered.handler;
    let name = registered.name();

    let outcome = AssertUnwindSafe(handler.execute(event_type, payload, context))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::handler(name, "handler panicked")));

    match &outcome {
        Ok(output) => {
            if let Err(e) = handler.after_execute(event_type, payload, context, output).await {
                warn!(handler = %name, event_id = %context.event_id, error = %e, "after_execute hook failed");
            }
        }
        Err(err) => {
            warn!(
                handler = %name,
                event_id = %context.event_id,
                attempt = context.attempt,
                error = %err,
                "Handler failed"
            );
            if let Err(e) = handler.on_error(event_type, payload, context, err).await {
                warn!(handler = %name, event_id = %context.event_id, error = %e, "on_error hook failed");
            }
        }
    }

    outcome
}

/// Executes matched handlers in priority order, each isolated from the
/// others.
pub struct HandlerExecutor {
    registry: Arc<HandlerRegistry>,
    queue: Option<Arc<HandlerQueueManager>>,
}

impl HandlerExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            queue: None,
        }
    }

    /// Route queued handlers through `queue` instead of running them inline.
    pub fn with_queue(mut self, queue: Arc<HandlerQueueManager>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> Option<&Arc<HandlerQueueManager>> {
        self.queue.as_ref()
    }

    /// Run every handler subscribed to `event_type`.
    ///
    /// Sync handlers run inline in priority order; queued handlers are handed
    /// to the queue manager and reported as `queued`. Without a queue manager
    /// queued handlers run inline too.
    pub async fn execute(
        &self,
        event_type: &str,
        payload: &Value,
        context: &NotificationContext,
    ) -> Vec<HandlerResult> {
        let handlers = self.registry.get_handlers(event_type);
        let mut results = Vec::with_capacity(handlers.len());

        for registered in &handlers {
            let name = registered.name();

            if !registered.handler.can_handle(event_type, payload) {
                debug!(handler = %name, event_type = %event_type, "Handler declined event");
                results.push(HandlerResult::skipped(name, "declined by handler"));
                continue;
            }

            if !registered.handler.is_healthy().await {
                warn!(handler = %name, event_type = %event_type, "Handler unhealthy, skipping");
                results.push(HandlerResult::skipped(name, "handler unhealthy"));
                continue;
            }

            if registered.metadata.is_queued() {
                if let Some(queue) = &self.queue {
                    let result = match queue.enqueue(registered, event_type, payload, context).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(handler = %name, event_id = %context.event_id, error = %e, "Failed to queue handler");
                            HandlerResult::failed(name, e.to_string(), Default::default())
                        }
                    };
                    results.push(result);
                    continue;
                }
                debug!(handler = %name, "No handler queue available, running inline");
            }

            let started = Instant::now();
            let result = match invoke(registered, event_type, payload, context).await {
                Ok(output) => HandlerResult::completed(name, output, started.elapsed()),
                Err(e) => HandlerResult::failed(name, e.to_string(), started.elapsed()),
            };
            results.push(result);
        }

        if !results.is_empty() {
            debug!(
                event_type = %event_type,
                event_id = %context.event_id,
                handlers = results.len(),
                failed = results.iter().filter(|r| r.status == HandlerStatus::Failed).count(),
                "Handlers executed"
            );
        }
        results
    }
}
