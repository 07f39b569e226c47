//! Channel delivery.
//!
//! Providers bound to channel ids in a [`ChannelRegistry`], recipient
//! resolution, the retry engine and the [`Orchestrator`] that fans one event
//! out to every configured channel.

pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod recipients;
pub mod registry;
pub mod retry;
pub mod types;

pub use orchestrator::Orchestrator;
pub use provider::ChannelProvider;
pub use recipients::{RecipientResolver, RecipientRule, StaticRecipientResolver};
pub use registry::ChannelRegistry;
pub use retry::{RetryEngine, RetryOn, RetryPolicy, is_retryable_error, is_retryable_status};
pub use types::{
    DistributionKind, NotificationContext, NotificationResult, NotificationStatus, Recipient,
    RecipientDistribution, RecipientPreferences,
};
