//! Service container.
//!
//! Wires providers, recipients, handlers, the queue backend and the
//! execution manager from [`AppConfig`] and [`DispatchConfig`], and manages
//! their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::config::{AppConfig, DispatchConfig, ProviderKind};
use crate::execution::{
    DeploymentMode, ExecutionDeps, ExecutionModeManager, ExecutionSettings,
};
use crate::handlers::{AuditHandler, HandlerExecutor, HandlerQueueManager, HandlerRegistry};
use crate::notification::providers::register_providers;
use crate::notification::{ChannelRegistry, Orchestrator, RetryEngine, StaticRecipientResolver};
use crate::queue::{InMemoryJobQueue, JobQueue, QueueConfig, ResultStore};
use crate::utils::http_client::install_rustls_provider;

/// Interval of the dead-letter retention sweep.
const DEAD_LETTER_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Holds every service of one dispatcher process.
pub struct ServiceContainer {
    pub manager: Arc<ExecutionModeManager>,
    pub channels: Arc<ChannelRegistry>,
    pub handlers: Arc<HandlerRegistry>,
    queue: Option<Arc<InMemoryJobQueue>>,
    dead_letter_retention: chrono::Duration,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build all services. Provider validation failures abort here.
    pub fn build(app: &AppConfig, dispatch: DispatchConfig) -> Result<Self> {
        info!(mode = %app.mode, queue = app.queue_enabled, "Initializing service container");

        if dispatch
            .providers
            .iter()
            .any(|p| p.kind == ProviderKind::Webhook)
        {
            install_rustls_provider();
        }

        let channels = Arc::new(ChannelRegistry::new());
        register_providers(&channels, &dispatch.providers)?;

        let catalog = Arc::new(dispatch.catalog()?);
        let resolver = Arc::new(StaticRecipientResolver::new(dispatch.recipients));
        let orchestrator = Arc::new(Orchestrator::new(
            catalog,
            channels.clone(),
            resolver,
            RetryEngine::new(dispatch.retry),
        ));

        let queue = app.queue_enabled.then(|| {
            Arc::new(InMemoryJobQueue::with_config(QueueConfig {
                poll_interval: app.poll_interval,
            }))
        });

        let handlers = Arc::new(HandlerRegistry::new());
        if dispatch.audit_handler {
            handlers.register_handler(Arc::new(AuditHandler::new()))?;
        }

        let mut executor = HandlerExecutor::new(handlers.clone());
        if let Some(queue) = &queue {
            let backend: Arc<dyn JobQueue> = queue.clone();
            executor = executor.with_queue(Arc::new(HandlerQueueManager::new(
                backend,
                handlers.clone(),
            )));
        }

        let manager = ExecutionModeManager::new(
            ExecutionSettings::from_app(app),
            ExecutionDeps {
                orchestrator,
                handlers: Some(Arc::new(executor)),
                queue: queue.clone().map(|q| q as Arc<dyn JobQueue>),
                results: Arc::new(ResultStore::new()),
            },
        )?;

        Ok(Self {
            manager: Arc::new(manager),
            channels,
            handlers,
            queue,
            dead_letter_retention: chrono::Duration::days(i64::from(
                app.dead_letter_retention_days,
            )),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start workers and background maintenance.
    pub fn initialize(&self) -> Result<()> {
        self.manager.start_workers()?;
        self.start_dead_letter_cleanup();
        Ok(())
    }

    fn start_dead_letter_cleanup(&self) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        let retention = self.dead_letter_retention;
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(DEAD_LETTER_SWEEP_INTERVAL) => {
                        let removed = queue.cleanup_dead_letters(retention);
                        if removed > 0 {
                            info!(removed, "Cleaned up expired dead letters");
                        }
                    }
                }
            }
            debug!("Dead letter cleanup stopped");
        });
    }

    pub fn mode(&self) -> DeploymentMode {
        self.manager.mode()
    }

    /// The in-memory backend, when queueing is enabled.
    pub fn queue(&self) -> Option<&Arc<InMemoryJobQueue>> {
        self.queue.as_ref()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down service container");
        self.cancellation_token.cancel();
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const DISPATCH: &str = r#"{
        "events": { "user.created": { "channels": ["email"] } },
        "providers": [ { "channel": "email" } ],
        "audit_handler": true
    }"#;

    #[tokio::test]
    async fn test_build_registers_providers_and_audit_handler() {
        let container =
            ServiceContainer::build(&AppConfig::default(), DispatchConfig::parse(DISPATCH).unwrap())
                .unwrap();

        assert_eq!(container.channels.list_channels(), vec!["email"]);
        assert!(container.handlers.get("audit").is_some());
        assert!(container.queue().is_some());
        assert_eq!(container.mode(), DeploymentMode::Hybrid);
    }

    #[tokio::test]
    async fn test_worker_mode_requires_queue() {
        let app = AppConfig {
            mode: DeploymentMode::Worker,
            queue_enabled: false,
            ..Default::default()
        };
        let err = ServiceContainer::build(&app, DispatchConfig::parse(DISPATCH).unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invalid_webhook_aborts_build() {
        let dispatch = DispatchConfig::parse(
            r#"{ "providers": [ { "channel": "hook", "kind": "webhook", "settings": { "url": "ftp://nope" } } ] }"#,
        )
        .unwrap();
        let err = ServiceContainer::build(&AppConfig::default(), dispatch)
            .err()
            .unwrap();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("scheme"));
    }
}
