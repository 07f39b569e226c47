//! Reference channel providers.

pub mod log;
pub mod webhook;

use std::sync::Arc;

use tracing::info;

pub use log::LogProvider;
pub use webhook::{WebhookAuth, WebhookProvider, WebhookSettings};

use super::provider::ChannelProvider;
use super::registry::ChannelRegistry;
use crate::config::{ProviderConfig, ProviderKind};
use crate::{Error, Result};

/// Build the provider described by `config`.
///
/// The provider's own `validate_config` runs against the settings before it
/// is returned; any problem aborts with [`Error::Validation`].
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ChannelProvider>> {
    let provider: Arc<dyn ChannelProvider> = match config.kind {
        ProviderKind::Log => Arc::new(LogProvider::new(&config.channel)),
        ProviderKind::Webhook => {
            let settings: WebhookSettings = serde_json::from_value(config.settings.clone())
                .map_err(|e| {
                    Error::validation(format!(
                        "channel '{}': webhook settings are malformed: {e}",
                        config.channel
                    ))
                })?;
            Arc::new(WebhookProvider::new(&config.channel, settings)?)
        }
    };

    if config.kind != ProviderKind::Log
        && let Err(problems) = provider.validate_config(&config.settings)
    {
        return Err(Error::validation(format!(
            "channel '{}': {}",
            config.channel,
            problems.join("; ")
        )));
    }

    Ok(provider)
}

/// Build and register every configured provider.
pub fn register_providers(registry: &ChannelRegistry, configs: &[ProviderConfig]) -> Result<()> {
    for config in configs {
        let provider = build_provider(config)?;
        registry.register(&config.channel, provider)?;
    }

    info!(channels = ?registry.list_channels(), "Channel providers ready");
    Ok(())
}
