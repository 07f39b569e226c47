#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use notifyd::config::{EventCatalog, EventTypeConfig};
use notifyd::execution::{DeploymentMode, ExecutionDeps, ExecutionModeManager, ExecutionSettings};
use notifyd::handlers::HandlerExecutor;
use notifyd::notification::{
    ChannelProvider, ChannelRegistry, NotificationContext, NotificationResult, Orchestrator,
    Recipient, RecipientDistribution, RecipientResolver, RecipientRule, RetryEngine, RetryPolicy,
    StaticRecipientResolver,
};
use notifyd::queue::{InMemoryJobQueue, JobQueue, QueueConfig, ResultStore};
use notifyd::{Error, Result};

/// Provider failing with `Err` for its first `failures` calls.
pub struct ScriptedProvider {
    name: &'static str,
    channel: &'static str,
    failures: u32,
    calls: AtomicU32,
    attempts_seen: Mutex<Vec<u32>>,
}

impl ScriptedProvider {
    pub fn succeeding(name: &'static str, channel: &'static str) -> Arc<Self> {
        Self::failing_first(name, channel, 0)
    }

    pub fn failing_first(name: &'static str, channel: &'static str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            channel,
            failures,
            calls: AtomicU32::new(0),
            attempts_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing(name: &'static str, channel: &'static str) -> Arc<Self> {
        Self::failing_first(name, channel, u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts_seen.lock().clone()
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn send(
        &self,
        _distribution: &RecipientDistribution,
        _payload: &Value,
        context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>> {
        self.attempts_seen.lock().push(context.attempt);
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::provider(self.name, "upstream unavailable"));
        }
        Ok(vec![NotificationResult::sent(self.channel, self.name)])
    }
}

/// Provider that panics on every send.
pub struct PanickingProvider;

#[async_trait]
impl ChannelProvider for PanickingProvider {
    fn name(&self) -> &str {
        "panicky"
    }

    async fn send(
        &self,
        _distribution: &RecipientDistribution,
        _payload: &Value,
        _context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>> {
        panic!("provider bug")
    }
}

/// Resolver failing its first `failures` lookups.
pub struct FlakyResolver {
    failures: u32,
    calls: AtomicU32,
    inner: StaticRecipientResolver,
}

impl FlakyResolver {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            inner: everyone(),
        })
    }
}

#[async_trait]
impl RecipientResolver for FlakyResolver {
    async fn load(&self, event_type: &str, payload: &Value) -> Result<Vec<RecipientDistribution>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::Other("directory offline".to_string()));
        }
        self.inner.load(event_type, payload).await
    }
}

/// One recipient reachable on every test channel, for every event.
pub fn everyone() -> StaticRecipientResolver {
    StaticRecipientResolver::new(vec![RecipientRule {
        event_type: "*".to_string(),
        name: Some("everyone".to_string()),
        payload_pointer: None,
        distribution: RecipientDistribution::main(vec![
            Recipient::new("user-1")
                .with_address("email", "user@example.com")
                .with_address("sms", "+15550100")
                .with_address("push", "device-1"),
        ]),
    }])
}

pub fn fast_retry() -> RetryEngine {
    RetryEngine::new(RetryPolicy {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        ..Default::default()
    })
}

pub fn fast_queue() -> Arc<InMemoryJobQueue> {
    Arc::new(InMemoryJobQueue::with_config(QueueConfig {
        poll_interval: Duration::from_millis(5),
    }))
}

/// Builder for a manager wired with in-test collaborators.
pub struct Harness {
    pub mode: DeploymentMode,
    pub events: Vec<(&'static str, EventTypeConfig)>,
    pub providers: Vec<(&'static str, Arc<dyn ChannelProvider>)>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub queue: Option<Arc<InMemoryJobQueue>>,
    pub handlers: Option<Arc<HandlerExecutor>>,
}

impl Harness {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            events: Vec::new(),
            providers: Vec::new(),
            resolver: Arc::new(everyone()),
            queue: None,
            handlers: None,
        }
    }

    pub fn event(mut self, event_type: &'static str, config: EventTypeConfig) -> Self {
        self.events.push((event_type, config));
        self
    }

    pub fn provider(mut self, channel: &'static str, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers.push((channel, provider));
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn RecipientResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn queue(mut self, queue: Arc<InMemoryJobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn handlers(mut self, handlers: Arc<HandlerExecutor>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn build(self) -> Result<ExecutionModeManager> {
        let catalog = EventCatalog::new(
            self.events
                .into_iter()
                .map(|(name, config)| (name.to_string(), config))
                .collect(),
        )?;

        let registry = Arc::new(ChannelRegistry::new());
        for (channel, provider) in self.providers {
            registry.register(channel, provider)?;
        }

        let orchestrator = Orchestrator::new(Arc::new(catalog), registry, self.resolver, fast_retry());

        ExecutionModeManager::new(
            ExecutionSettings {
                mode: self.mode,
                worker_concurrency: 2,
                default_timeout: Duration::from_secs(5),
                queue_attempts: 3,
                queue_backoff: None,
                result_ttl: Duration::from_secs(60),
            },
            ExecutionDeps {
                orchestrator: Arc::new(orchestrator),
                handlers: self.handlers,
                queue: self.queue.map(|q| q as Arc<dyn JobQueue>),
                results: Arc::new(ResultStore::new()),
            },
        )
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
