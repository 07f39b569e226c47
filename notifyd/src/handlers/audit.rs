//! Built-in audit handler.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::{Handler, HandlerQueueConfig, WILDCARD};
use crate::Result;
use crate::notification::types::NotificationContext;

/// Logs every event after all other handlers ran.
#[derive(Debug, Default, Clone)]
pub struct AuditHandler;

impl AuditHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for AuditHandler {
    fn name(&self) -> &str {
        "audit"
    }

    fn event_types(&self) -> Vec<String> {
        vec![WILDCARD.to_string()]
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn queue_config(&self) -> Option<HandlerQueueConfig> {
        Some(HandlerQueueConfig::default())
    }

    async fn execute(
        &self,
        event_type: &str,
        _payload: &Value,
        context: &NotificationContext,
    ) -> Result<Value> {
        info!(
            event_type = %event_type,
            event_id = %context.event_id,
            correlation_id = %context.correlation_id,
            attempt = context.attempt,
            "Event audited"
        );
        Ok(json!({ "audited": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerExecutor, HandlerMetadata, HandlerRegistry, HandlerStatus};
    use std::sync::Arc;

    #[test]
    fn test_metadata() {
        let metadata = HandlerMetadata::from_handler(&AuditHandler::new());
        assert_eq!(metadata.name, "audit");
        assert!(metadata.is_wildcard());
        assert_eq!(metadata.priority, i32::MIN);
        assert!(!metadata.is_queued());
    }

    #[tokio::test]
    async fn test_audits_any_event() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_handler(Arc::new(AuditHandler::new())).unwrap();

        let results = HandlerExecutor::new(registry)
            .execute("order.paid", &json!({}), &NotificationContext::new("order.paid"))
            .await;
        assert_eq!(results[0].status, HandlerStatus::Completed);
        assert_eq!(results[0].output, Some(json!({ "audited": true })));
    }
}
