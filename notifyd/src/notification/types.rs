//! Core dispatch data model.
//!
//! Contexts, recipients and delivery results shared by providers, the
//! orchestrator and the queue worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-event context propagated to providers and handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContext {
    /// Unique id of the logical event.
    pub event_id: String,
    /// Stable id shared by retries and handler executions of the event.
    pub correlation_id: String,
    /// Event type being dispatched.
    pub event_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Open key/value bag.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NotificationContext {
    /// Create a context for a fresh event.
    pub fn new(event_type: impl Into<String>) -> Self {
        let event_id = Uuid::new_v4().to_string();
        Self {
            correlation_id: event_id.clone(),
            event_id,
            event_type: event_type.into(),
            attempt: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Context seen by the `n`-th attempt (1-based) of a retried operation.
    pub(crate) fn for_attempt(&self, n: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = self.attempt.max(1).saturating_add(n.saturating_sub(1));
        ctx
    }
}

/// Per-recipient delivery preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientPreferences {
    /// Whether the recipient accepts notifications at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Channels the recipient opted out of.
    #[serde(default)]
    pub muted_channels: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for RecipientPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            muted_channels: Vec::new(),
        }
    }
}

/// A single notification recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Channel id -> address (e.g. `email` -> `user@example.com`).
    #[serde(default)]
    pub addresses: HashMap<String, String>,
    #[serde(default)]
    pub preferences: RecipientPreferences,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            addresses: HashMap::new(),
            preferences: RecipientPreferences::default(),
        }
    }

    pub fn with_address(mut self, channel: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(channel.into(), address.into());
        self
    }

    /// Address for `channel` if the recipient accepts deliveries on it.
    pub fn deliverable_address(&self, channel: &str) -> Option<&str> {
        if !self.preferences.enabled || self.preferences.muted_channels.iter().any(|c| c == channel)
        {
            return None;
        }
        self.addresses.get(channel).map(String::as_str)
    }
}

/// Recipient group within a distribution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DistributionKind {
    Main,
    Copy,
    Blind,
}

/// Recipients resolved for one event, grouped as MAIN / COPY / BLIND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDistribution {
    /// Optional name of the rule that produced this distribution.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main: Vec<Recipient>,
    #[serde(default)]
    pub copy: Vec<Recipient>,
    #[serde(default)]
    pub blind: Vec<Recipient>,
}

impl RecipientDistribution {
    pub fn main(recipients: Vec<Recipient>) -> Self {
        Self {
            main: recipients,
            ..Default::default()
        }
    }

    pub fn group(&self, kind: DistributionKind) -> &[Recipient] {
        match kind {
            DistributionKind::Main => &self.main,
            DistributionKind::Copy => &self.copy,
            DistributionKind::Blind => &self.blind,
        }
    }

    /// All recipients in MAIN, COPY, BLIND order.
    pub fn iter(&self) -> impl Iterator<Item = (DistributionKind, &Recipient)> {
        [
            DistributionKind::Main,
            DistributionKind::Copy,
            DistributionKind::Blind,
        ]
        .into_iter()
        .flat_map(move |kind| self.group(kind).iter().map(move |r| (kind, r)))
    }

    pub fn len(&self) -> usize {
        self.main.len() + self.copy.len() + self.blind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivery status of a notification result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Failed,
    Pending,
    Retrying,
    Skipped,
}

impl NotificationStatus {
    /// Whether the retry engine should try again after seeing this status.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Retrying)
    }
}

/// Outcome of one delivery attempt for a (channel, distribution) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub channel: String,
    pub provider: String,
    pub status: NotificationStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NotificationResult {
    fn new(channel: impl Into<String>, provider: impl Into<String>, status: NotificationStatus) -> Self {
        Self {
            channel: channel.into(),
            provider: provider.into(),
            status,
            error: None,
            sent_at: None,
            attempts: 1,
            next_retry_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn sent(channel: impl Into<String>, provider: impl Into<String>) -> Self {
        let mut result = Self::new(channel, provider, NotificationStatus::Sent);
        result.sent_at = Some(Utc::now());
        result
    }

    pub fn failed(
        channel: impl Into<String>,
        provider: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(channel, provider, NotificationStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn skipped(
        channel: impl Into<String>,
        provider: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(channel, provider, NotificationStatus::Skipped);
        result.error = Some(reason.into());
        result
    }

    pub fn pending(channel: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::new(channel, provider, NotificationStatus::Pending)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_sent(&self) -> bool {
        self.status == NotificationStatus::Sent
    }
}
