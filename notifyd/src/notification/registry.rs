//! Channel provider registry.
//!
//! Maps each channel id to exactly one provider. Built once in the
//! composition root and shared by reference with the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::provider::ChannelProvider;
use crate::{Error, Result};

/// Registry of channel providers.
#[derive(Default)]
pub struct ChannelRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ChannelProvider>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `provider` to `channel`.
    ///
    /// Re-registering the same provider instance is a no-op; binding a
    /// different provider to an already bound channel is rejected.
    pub fn register(
        &self,
        channel: impl Into<String>,
        provider: Arc<dyn ChannelProvider>,
    ) -> Result<()> {
        let channel = channel.into();
        let mut providers = self.providers.write();

        if let Some(existing) = providers.get(&channel) {
            if Arc::ptr_eq(existing, &provider) {
                return Ok(());
            }
            return Err(Error::DuplicateChannel {
                channel,
                existing: existing.name().to_string(),
            });
        }

        info!(channel = %channel, provider = %provider.name(), "Registered channel provider");
        providers.insert(channel, provider);
        Ok(())
    }

    /// Look up the provider bound to `channel`.
    pub fn resolve(&self, channel: &str) -> Result<Arc<dyn ChannelProvider>> {
        self.providers
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))
    }

    /// Registered channel ids, sorted.
    pub fn list_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.providers.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
