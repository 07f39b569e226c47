//! Channel provider contract.

use async_trait::async_trait;
use serde_json::Value;

use super::types::{NotificationContext, NotificationResult, RecipientDistribution};
use crate::Result;

/// A concrete delivery mechanism bound to a channel.
///
/// Ordinary delivery failures are reported as `failed` results. An `Err`
/// is reserved for programmer errors; the retry engine still treats it as a
/// failed attempt.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Provider name reported in results.
    fn name(&self) -> &str;

    /// Deliver `payload` to one recipient distribution.
    async fn send(
        &self,
        distribution: &RecipientDistribution,
        payload: &Value,
        context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>>;

    /// Check a candidate configuration, returning every problem found.
    fn validate_config(&self, _config: &Value) -> std::result::Result<(), Vec<String>> {
        Ok(())
    }

    /// Whether the provider currently considers itself able to deliver.
    async fn health_check(&self) -> bool {
        true
    }
}
