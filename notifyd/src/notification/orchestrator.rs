//! Per-event fan-out to channel providers.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::provider::ChannelProvider;
use super::recipients::RecipientResolver;
use super::registry::ChannelRegistry;
use super::retry::RetryEngine;
use super::types::{NotificationContext, NotificationResult, RecipientDistribution};
use crate::config::EventCatalog;
use crate::{Error, Result};

/// Provider name reported when a channel has no provider.
const NO_PROVIDER: &str = "none";

/// Resolves channels, recipients and providers for one event and delivers
/// to each channel with retries.
///
/// Channels run as separate tasks, so one channel failing or panicking never
/// affects its siblings. Distributions within a channel are delivered one
/// after another.
pub struct Orchestrator {
    catalog: Arc<EventCatalog>,
    registry: Arc<ChannelRegistry>,
    resolver: Arc<dyn RecipientResolver>,
    retry: RetryEngine,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<EventCatalog>,
        registry: Arc<ChannelRegistry>,
        resolver: Arc<dyn RecipientResolver>,
        retry: RetryEngine,
    ) -> Self {
        Self {
            catalog,
            registry,
            resolver,
            retry,
        }
    }

    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Deliver `payload` on every channel configured for `event_type`.
    ///
    /// Unknown event types and events without recipients yield an empty list.
    /// Delivery problems come back as `failed` results; only recipient
    /// resolution errors are returned as `Err`.
    pub async fn process_event(
        &self,
        event_type: &str,
        payload: Arc<Value>,
        context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>> {
        let Some(config) = self.catalog.get(event_type) else {
            warn!(
                event_type = %event_type,
                event_id = %context.event_id,
                "No configuration for event type, nothing to dispatch"
            );
            return Ok(Vec::new());
        };

        let distributions = self
            .resolver
            .load(event_type, &payload)
            .await
            .map_err(|e| Error::RecipientResolution {
                event_type: event_type.to_string(),
                message: e.to_string(),
            })?;

        if distributions.is_empty() {
            info!(
                event_type = %event_type,
                event_id = %context.event_id,
                "No recipients resolved for event"
            );
            return Ok(Vec::new());
        }

        let distributions: Arc<[RecipientDistribution]> = distributions.into();
        let mut tasks: Vec<(String, JoinHandle<Vec<NotificationResult>>)> =
            Vec::with_capacity(config.channels.len());

        for channel in &config.channels {
            let provider = match self.registry.resolve(channel) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(channel = %channel, event_id = %context.event_id, error = %e, "Skipping channel");
                    let results = vec![NotificationResult::failed(
                        channel,
                        NO_PROVIDER,
                        "no provider",
                    )];
                    tasks.push((channel.clone(), tokio::spawn(async move { results })));
                    continue;
                }
            };

            let delivery = ChannelDelivery {
                channel: channel.clone(),
                provider,
                distributions: distributions.clone(),
                payload: payload.clone(),
                context: context.clone(),
                retry: self.retry.clone(),
                max_attempts: config.retry_attempts,
            };
            tasks.push((channel.clone(), tokio::spawn(delivery.run())));
        }

        let mut results = Vec::new();
        for (channel, task) in tasks {
            match task.await {
                Ok(channel_results) => results.extend(channel_results),
                Err(e) => {
                    error!(channel = %channel, event_id = %context.event_id, error = %e, "Channel delivery task failed");
                    results.push(NotificationResult::failed(
                        &channel,
                        NO_PROVIDER,
                        format!("delivery task failed: {e}"),
                    ));
                }
            }
        }

        debug!(
            event_type = %event_type,
            event_id = %context.event_id,
            results = results.len(),
            sent = results.iter().filter(|r| r.is_sent()).count(),
            "Event dispatched"
        );
        Ok(results)
    }
}

/// Everything one channel task needs.
struct ChannelDelivery {
    channel: String,
    provider: Arc<dyn ChannelProvider>,
    distributions: Arc<[RecipientDistribution]>,
    payload: Arc<Value>,
    context: NotificationContext,
    retry: RetryEngine,
    max_attempts: u32,
}

impl ChannelDelivery {
    async fn run(self) -> Vec<NotificationResult> {
        if !self.provider.health_check().await {
            warn!(
                channel = %self.channel,
                provider = %self.provider.name(),
                "Provider reports unhealthy, attempting delivery anyway"
            );
        }

        let mut results = Vec::new();
        for (index, distribution) in self.distributions.iter().enumerate() {
            let provider = &self.provider;
            let payload: &Value = &self.payload;

            let outcome = self
                .retry
                .execute_with_result(
                    |ctx| async move { provider.send(distribution, payload, &ctx).await },
                    self.max_attempts,
                    &self.context,
                    None,
                )
                .await;

            let mut batch = match outcome {
                Ok(batch) => batch,
                Err(err) => {
                    let attempts = err.attempts().unwrap_or(1);
                    warn!(
                        channel = %self.channel,
                        provider = %self.provider.name(),
                        event_id = %self.context.event_id,
                        attempts,
                        error = %err,
                        "Delivery failed"
                    );
                    let mut failed =
                        NotificationResult::failed(&self.channel, self.provider.name(), err.to_string());
                    failed.attempts = attempts;
                    vec![failed]
                }
            };

            for result in &mut batch {
                result
                    .metadata
                    .entry("distribution_index".to_string())
                    .or_insert_with(|| json!(index));
                if let Some(name) = &distribution.name {
                    result
                        .metadata
                        .entry("distribution".to_string())
                        .or_insert_with(|| json!(name));
                }
            }
            results.extend(batch);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventTypeConfig;
    use crate::notification::recipients::StaticRecipientResolver;
    use crate::notification::retry::RetryPolicy;
    use crate::notification::types::{NotificationStatus, Recipient};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedProvider {
        name: &'static str,
        channel: &'static str,
        status: NotificationStatus,
        calls: AtomicU32,
    }

    impl FixedProvider {
        fn new(name: &'static str, channel: &'static str, status: NotificationStatus) -> Arc<Self> {
            Arc::new(Self {
                name,
                channel,
                status,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(
            &self,
            _distribution: &RecipientDistribution,
            _payload: &Value,
            _context: &NotificationContext,
        ) -> Result<Vec<NotificationResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![match self.status {
                NotificationStatus::Sent => NotificationResult::sent(self.channel, self.name),
                _ => NotificationResult::failed(self.channel, self.name, "rejected"),
            }])
        }
    }

    struct PanickingProvider;

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
            panic!("provider bug");
        }
    }

    /// Fails transiently on the first send and permanently afterwards.
    struct TwoPhaseProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChannelProvider for TwoPhaseProvider {
        fn name(&self) -> &str {
            "smtp"
        }

        async fn send(
            &self,
            _distribution: &RecipientDistribution,
            _payload: &Value,
            _context: &NotificationContext,
        ) -> Result<Vec<NotificationResult>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::provider("smtp", "connection reset"))
            } else {
                Err(Error::provider("smtp", "invalid address"))
            }
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl RecipientResolver for FailingResolver {
        async fn load(&self, _event_type: &str, _payload: &Value) -> Result<Vec<RecipientDistribution>> {
            Err(Error::Other("directory offline".to_string()))
        }
    }

    fn catalog(channels: &[&str], attempts: u32) -> Arc<EventCatalog> {
        Arc::new(
            EventCatalog::new(HashMap::from([(
                "user.created".to_string(),
                EventTypeConfig::new(channels.iter().copied()).with_retry_attempts(attempts),
            )]))
            .unwrap(),
        )
    }

    fn resolver(distributions: usize) -> Arc<dyn RecipientResolver> {
        let rules = (0..distributions)
            .map(|i| crate::notification::recipients::RecipientRule {
                event_type: "user.created".to_string(),
                name: Some(format!("rule-{i}")),
                payload_pointer: None,
                distribution: RecipientDistribution::main(vec![
                    Recipient::new(format!("u{i}")).with_address("email", "user@example.com"),
                ]),
            })
            .collect();
        Arc::new(StaticRecipientResolver::new(rules))
    }

    fn fast_retry() -> RetryEngine {
        RetryEngine::new(RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_one_result_per_channel_and_distribution() {
        let registry = Arc::new(ChannelRegistry::new());
        registry
            .register("email", FixedProvider::new("smtp", "email", NotificationStatus::Sent))
            .unwrap();
        registry
            .register("sms", FixedProvider::new("twilio", "sms", NotificationStatus::Sent))
            .unwrap();

        let orchestrator =
            Orchestrator::new(catalog(&["email", "sms"], 1), registry, resolver(2), fast_retry());
        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].channel, "email");
        assert_eq!(results[0].metadata["distribution"], json!("rule-0"));
        assert_eq!(results[1].metadata["distribution_index"], json!(1));
        assert_eq!(results[2].channel, "sms");
        assert!(results.iter().all(|r| r.is_sent()));
    }

    #[tokio::test]
    async fn test_missing_provider_is_isolated() {
        let registry = Arc::new(ChannelRegistry::new());
        registry
            .register("email", FixedProvider::new("smtp", "email", NotificationStatus::Sent))
            .unwrap();

        let orchestrator =
            Orchestrator::new(catalog(&["push", "email"], 1), registry, resolver(1), fast_retry());
        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].channel, "push");
        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("no provider"));
        assert!(results[1].is_sent());
    }

    #[tokio::test]
    async fn test_panicking_provider_does_not_abort_siblings() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.register("push", Arc::new(PanickingProvider)).unwrap();
        registry
            .register("email", FixedProvider::new("smtp", "email", NotificationStatus::Sent))
            .unwrap();

        let orchestrator =
            Orchestrator::new(catalog(&["push", "email"], 1), registry, resolver(1), fast_retry());
        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();

        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert!(results[1].is_sent());
    }

    #[tokio::test]
    async fn test_failed_results_are_retried_up_to_ceiling() {
        let registry = Arc::new(ChannelRegistry::new());
        let provider = FixedProvider::new("smtp", "email", NotificationStatus::Failed);
        registry.register("email", provider.clone()).unwrap();

        let orchestrator = Orchestrator::new(catalog(&["email"], 3), registry, resolver(1), fast_retry());
        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert_eq!(results[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_reports_attempts_made() {
        let registry = Arc::new(ChannelRegistry::new());
        let provider = Arc::new(TwoPhaseProvider {
            calls: AtomicU32::new(0),
        });
        registry.register("email", provider.clone()).unwrap();

        let retry = RetryEngine::new(
            RetryPolicy {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                ..Default::default()
            }
            .transient_only(),
        );
        let orchestrator = Orchestrator::new(catalog(&["email"], 3), registry, resolver(1), retry);
        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert_eq!(results[0].attempts, 2);
        assert!(results[0].error.as_deref().unwrap_or("").contains("invalid address"));
    }

    #[tokio::test]
    async fn test_unknown_event_and_no_recipients_are_empty() {
        let registry = Arc::new(ChannelRegistry::new());
        let orchestrator = Orchestrator::new(catalog(&["email"], 1), registry, resolver(0), fast_retry());

        let results = orchestrator
            .process_event("order.paid", Arc::new(json!({})), &NotificationContext::new("order.paid"))
            .await
            .unwrap();
        assert!(results.is_empty());

        let results = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_error_propagates() {
        let registry = Arc::new(ChannelRegistry::new());
        let orchestrator = Orchestrator::new(
            catalog(&["email"], 1),
            registry,
            Arc::new(FailingResolver),
            fast_retry(),
        );

        let err = orchestrator
            .process_event(
                "user.created",
                Arc::new(json!({})),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecipientResolution { .. }));
        assert!(!err.is_permanent());
    }
}
