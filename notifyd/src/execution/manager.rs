//! Execution-mode manager.
//!
//! Decides per emission whether the event is processed on the calling task
//! or queued for a worker, and owns the worker side of event jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeploymentMode, DispatchPath, DispatchStats, EmissionResult, EmitOptions};
use crate::config::{AppConfig, EventCatalog, EventTypeConfig, ProcessingMode};
use crate::handlers::{HandlerExecutor, HandlerResult};
use crate::notification::orchestrator::Orchestrator;
use crate::notification::types::{NotificationContext, NotificationResult};
use crate::queue::{
    DelayConfig, EVENT_JOB_NAME, EventOutcome, Job, JobOptions, JobProcessor, JobQueue,
    QueuedEvent, ResultStore,
};
use crate::{Error, Result};

/// Tunables of the execution manager.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub mode: DeploymentMode,
    /// Consumers of the event queue.
    pub worker_concurrency: usize,
    /// Wait-for-result timeout when neither the call nor the event sets one.
    pub default_timeout: Duration,
    /// Deliveries allowed per event job.
    pub queue_attempts: u32,
    pub queue_backoff: Option<DelayConfig>,
    /// Retention of stored result sets.
    pub result_ttl: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Hybrid,
            worker_concurrency: 4,
            default_timeout: Duration::from_millis(30_000),
            queue_attempts: 3,
            queue_backoff: Some(DelayConfig::exponential(1000)),
            result_ttl: Duration::from_secs(3600),
        }
    }
}

impl ExecutionSettings {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            mode: config.mode,
            worker_concurrency: config.worker_concurrency,
            default_timeout: config.default_timeout,
            result_ttl: config.result_ttl,
            ..Default::default()
        }
    }
}

/// Collaborators of the execution manager, built by the composition root.
pub struct ExecutionDeps {
    pub orchestrator: Arc<Orchestrator>,
    pub handlers: Option<Arc<HandlerExecutor>>,
    pub queue: Option<Arc<dyn JobQueue>>,
    pub results: Arc<ResultStore>,
}

struct Shared {
    settings: ExecutionSettings,
    orchestrator: Arc<Orchestrator>,
    handlers: Option<Arc<HandlerExecutor>>,
    queue: Option<Arc<dyn JobQueue>>,
    results: Arc<ResultStore>,
}

impl Shared {
    fn catalog(&self) -> &EventCatalog {
        self.orchestrator.catalog()
    }

    fn lookup(&self, event_type: &str) -> Result<Arc<EventTypeConfig>> {
        self.catalog()
            .get(event_type)
            .ok_or_else(|| Error::UnknownEventType(event_type.to_string()))
    }

    /// Channel delivery followed by handlers, on the current task.
    async fn run_event(
        &self,
        event_type: &str,
        payload: Arc<Value>,
        context: &NotificationContext,
    ) -> Result<(Vec<NotificationResult>, Vec<HandlerResult>)> {
        let results = self
            .orchestrator
            .process_event(event_type, payload.clone(), context)
            .await?;

        let handler_results = match &self.handlers {
            Some(handlers) => handlers.execute(event_type, &payload, context).await,
            None => Vec::new(),
        };

        Ok((results, handler_results))
    }
}

#[async_trait]
impl JobProcessor for Shared {
    async fn process(&self, job: &Job) -> Result<()> {
        let event: QueuedEvent = serde_json::from_value(job.data.clone())
            .map_err(|e| Error::validation(format!("malformed event job {}: {e}", job.id)))?;
        self.lookup(&event.event_type)?;

        let context = NotificationContext {
            event_id: event.event_id.clone(),
            correlation_id: event.correlation_id,
            event_type: event.event_type.clone(),
            attempt: job.attempts_made + 1,
            metadata: event.metadata,
        };

        let started = Instant::now();
        let (results, handler_results) = self
            .run_event(&event.event_type, Arc::new(event.payload), &context)
            .await?;

        info!(
            event_id = %context.event_id,
            event_type = %context.event_type,
            attempt = context.attempt,
            results = results.len(),
            handlers = handler_results.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Queued event processed"
        );
        self.results
            .put(&context.event_id, EventOutcome::new(results, handler_results));
        Ok(())
    }
}

/// Routes emissions to immediate or queued processing.
pub struct ExecutionModeManager {
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
}

impl ExecutionModeManager {
    /// Validate the mode against the available collaborators.
    ///
    /// `worker` mode without a queue backend fails here rather than on the
    /// first event.
    pub fn new(settings: ExecutionSettings, deps: ExecutionDeps) -> Result<Self> {
        match settings.mode {
            DeploymentMode::Worker if deps.queue.is_none() => {
                return Err(Error::config("worker mode requires a queue backend"));
            }
            DeploymentMode::Hybrid if deps.queue.is_none() => {
                info!("Hybrid mode without a queue backend, events are processed immediately");
            }
            _ => {}
        }

        info!(
            mode = %settings.mode,
            queue = deps.queue.is_some(),
            handlers = deps.handlers.is_some(),
            "Execution manager ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                orchestrator: deps.orchestrator,
                handlers: deps.handlers,
                queue: deps.queue,
                results: deps.results,
            }),
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> DeploymentMode {
        self.shared.settings.mode
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.shared.results
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.shared.queue.as_ref()
    }

    /// Pick the dispatch path.
    ///
    /// `api` is always immediate and `worker` always queued. `hybrid` takes
    /// the call's mode, then the event's default processing, then queues when
    /// a backend exists. A queued choice without a backend falls back to
    /// immediate processing.
    pub fn decide(&self, options: &EmitOptions, config: &EventTypeConfig) -> DispatchPath {
        let has_queue = self.shared.queue.is_some();

        match self.shared.settings.mode {
            DeploymentMode::Api => DispatchPath::Immediate,
            DeploymentMode::Worker => DispatchPath::Queued,
            DeploymentMode::Hybrid => {
                let requested = options.mode.or(config.default_processing);
                match requested {
                    Some(ProcessingMode::Sync) => DispatchPath::Immediate,
                    Some(ProcessingMode::Async) if has_queue => DispatchPath::Queued,
                    Some(ProcessingMode::Async) => {
                        warn!("Async processing requested without a queue backend, processing immediately");
                        DispatchPath::Immediate
                    }
                    None if has_queue => DispatchPath::Queued,
                    None => DispatchPath::Immediate,
                }
            }
        }
    }

    /// Emit an event.
    ///
    /// Delivery problems never fail the call; they show up as `failed` or
    /// `pending` results. Unknown event types, events with nothing to run and
    /// queue backend errors are returned as `Err`.
    pub async fn emit(
        &self,
        event_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<EmissionResult> {
        let started = Instant::now();
        let config = self.shared.lookup(event_type)?;

        if config.channels.is_empty()
            && self
                .shared
                .handlers
                .as_ref()
                .is_none_or(|h| h.registry().get_handlers(event_type).is_empty())
        {
            return Err(Error::config(format!(
                "event type '{event_type}' has no channels or handlers"
            )));
        }

        let mut context = NotificationContext::new(event_type);
        if let Some(correlation_id) = &options.correlation_id {
            context = context.with_correlation_id(correlation_id);
        }

        let path = self.decide(&options, &config);
        debug!(
            event_type = %event_type,
            event_id = %context.event_id,
            path = %path,
            "Emitting event"
        );

        match path {
            DispatchPath::Immediate => {
                let (results, handler_results) = self
                    .shared
                    .run_event(event_type, Arc::new(payload), &context)
                    .await?;

                Ok(EmissionResult {
                    event_id: context.event_id,
                    correlation_id: context.correlation_id,
                    mode: DispatchPath::Immediate,
                    results: Some(results),
                    handler_results,
                    queued_at: None,
                    processing_duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            DispatchPath::Queued => self.enqueue(&config, payload, &options, context, started).await,
        }
    }

    async fn enqueue(
        &self,
        config: &EventTypeConfig,
        payload: Value,
        options: &EmitOptions,
        context: NotificationContext,
        started: Instant,
    ) -> Result<EmissionResult> {
        let queue = self
            .shared
            .queue
            .as_ref()
            .ok_or_else(|| Error::config("no queue backend configured"))?;

        let queued_at = Utc::now();
        let event = QueuedEvent {
            event_id: context.event_id.clone(),
            event_type: context.event_type.clone(),
            payload,
            correlation_id: context.correlation_id.clone(),
            attempt: context.attempt,
            created_at: queued_at,
            metadata: context.metadata.clone(),
        };

        let job_options = JobOptions {
            job_id: Some(context.event_id.clone()),
            priority: options.priority.unwrap_or(config.priority).weight(),
            delay: options.delay_ms.or(config.delay_ms).map(Duration::from_millis),
            attempts: self.shared.settings.queue_attempts,
            backoff: self.shared.settings.queue_backoff,
        };

        let job = queue
            .add(EVENT_JOB_NAME, serde_json::to_value(&event)?, job_options)
            .await?;
        debug!(event_id = %context.event_id, job_id = %job.id, "Event queued");

        let mut emission = EmissionResult {
            event_id: context.event_id.clone(),
            correlation_id: context.correlation_id.clone(),
            mode: DispatchPath::Queued,
            results: None,
            handler_results: Vec::new(),
            queued_at: Some(queued_at),
            processing_duration_ms: 0,
            timed_out: false,
        };

        if options.wait_for_result.unwrap_or(config.wait_for_result) {
            let timeout = self.wait_timeout(options, config);
            match self.shared.results.wait_for(&context.event_id, timeout).await {
                Some(outcome) => {
                    emission.results = Some(outcome.results.clone());
                    emission.handler_results = outcome.handler_results.clone();
                }
                None => {
                    warn!(
                        event_id = %context.event_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for queued event"
                    );
                    emission.results = Some(self.pending_results(config));
                    emission.timed_out = true;
                }
            }
        }

        emission.processing_duration_ms = started.elapsed().as_millis() as u64;
        Ok(emission)
    }

    /// The smaller of the call and event timeouts, else the default.
    fn wait_timeout(&self, options: &EmitOptions, config: &EventTypeConfig) -> Duration {
        [options.timeout_ms, config.timeout_ms]
            .into_iter()
            .flatten()
            .min()
            .map(Duration::from_millis)
            .unwrap_or(self.shared.settings.default_timeout)
    }

    fn pending_results(&self, config: &EventTypeConfig) -> Vec<NotificationResult> {
        let registry = self.shared.orchestrator.registry();
        config
            .channels
            .iter()
            .map(|channel| {
                let provider = registry
                    .resolve(channel)
                    .map(|p| p.name().to_string())
                    .unwrap_or_else(|_| "none".to_string());
                let mut result = NotificationResult::pending(channel, provider)
                    .with_metadata("timed_out", json!(true));
                result.attempts = 0;
                result
            })
            .collect()
    }

    /// Worker side: process one event job.
    pub async fn process_queued(&self, job: &Job) -> Result<()> {
        self.shared.process(job).await
    }

    /// Register consumers on the queue backend.
    ///
    /// The event consumer runs in `worker` and `hybrid` mode; handler queues
    /// run whenever a handler queue manager exists. Calling this twice is a
    /// no-op.
    pub fn start_workers(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(queue) = &self.shared.queue {
            if self.shared.settings.mode != DeploymentMode::Api {
                let processor: Arc<dyn JobProcessor> = self.shared.clone();
                queue.process(
                    EVENT_JOB_NAME,
                    self.shared.settings.worker_concurrency,
                    processor,
                )?;
            }
            if let Some(handler_queue) = self.shared.handlers.as_ref().and_then(|h| h.queue()) {
                handler_queue.start()?;
            }
        }

        self.spawn_result_cleanup();
        info!(mode = %self.mode(), "Workers started");
        Ok(())
    }

    fn spawn_result_cleanup(&self) {
        let results = self.shared.results.clone();
        let ttl = self.shared.settings.result_ttl;
        let token = self.cancellation_token.clone();
        let interval = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let removed = results.cleanup(ttl);
                        if removed > 0 {
                            debug!(removed, "Expired stored results");
                        }
                    }
                }
            }
        });
    }

    pub async fn stats(&self) -> DispatchStats {
        let queue = match &self.shared.queue {
            Some(queue) => Some(queue.stats().await),
            None => None,
        };

        DispatchStats {
            mode: self.mode(),
            channels: self.shared.orchestrator.registry().list_channels(),
            event_types: self.shared.catalog().len(),
            handlers: self
                .shared
                .handlers
                .as_ref()
                .map(|h| h.registry().len())
                .unwrap_or(0),
            stored_results: self.shared.results.len(),
            pending_waiters: self.shared.results.pending_waiters(),
            queue,
        }
    }

    /// Stop background work and close the queue backend.
    pub async fn shutdown(&self) {
        info!("Shutting down execution manager");
        self.cancellation_token.cancel();
        if let Some(queue) = &self.shared.queue {
            queue.close().await;
        }
    }
}
