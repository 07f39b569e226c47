//! Provider that records deliveries in the log.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::Result;
use crate::notification::provider::ChannelProvider;
use crate::notification::types::{NotificationContext, NotificationResult, RecipientDistribution};

/// Writes one structured log line per deliverable recipient.
///
/// Useful as a stand-in for real channels in development and as the default
/// provider kind of the dispatch configuration.
#[derive(Debug, Clone)]
pub struct LogProvider {
    channel: String,
}

impl LogProvider {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChannelProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        distribution: &RecipientDistribution,
        payload: &Value,
        context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>> {
        let mut delivered = 0usize;

        for (kind, recipient) in distribution.iter() {
            let Some(address) = recipient.deliverable_address(&self.channel) else {
                debug!(
                    channel = %self.channel,
                    recipient = %recipient.id,
                    "Recipient has no deliverable address"
                );
                continue;
            };

            info!(
                channel = %self.channel,
                event_id = %context.event_id,
                event_type = %context.event_type,
                attempt = context.attempt,
                group = %kind,
                recipient = %recipient.id,
                address = %address,
                payload = %payload,
                "Notification delivered"
            );
            delivered += 1;
        }

        let mut result = if delivered == 0 {
            NotificationResult::skipped(&self.channel, self.name(), "no deliverable recipients")
        } else {
            NotificationResult::sent(&self.channel, self.name())
                .with_metadata("recipients", json!(delivered))
        };

        if let Some(name) = &distribution.name {
            result = result.with_metadata("distribution", json!(name));
        }

        Ok(vec![result])
    }
}
