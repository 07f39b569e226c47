//! Recipient resolution.
//!
//! The orchestrator only consumes the distributions produced here. Real
//! deployments plug in their own [`RecipientResolver`]; the static resolver
//! covers rule-based setups and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::types::{Recipient, RecipientDistribution};
use crate::Result;

/// Loads recipient distributions for an event.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Called once per `process_event`.
    async fn load(&self, event_type: &str, payload: &Value) -> Result<Vec<RecipientDistribution>>;
}

/// A rule producing one distribution for matching events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRule {
    /// Exact event type, or `*` for every event.
    pub event_type: String,
    /// Rule name copied into the distribution.
    #[serde(default)]
    pub name: Option<String>,
    /// JSON pointer into the payload holding a recipient (or array of
    /// recipients) appended to MAIN.
    #[serde(default)]
    pub payload_pointer: Option<String>,
    /// Fixed recipients.
    #[serde(default)]
    pub distribution: RecipientDistribution,
}

impl RecipientRule {
    fn build(&self, payload: &Value) -> RecipientDistribution {
        let mut distribution = self.distribution.clone();
        if distribution.name.is_none() {
            distribution.name = self.name.clone();
        }

        if let Some(pointer) = &self.payload_pointer {
            match payload.pointer(pointer) {
                Some(value) => distribution.main.extend(recipients_from_value(value)),
                None => debug!(pointer = %pointer, "Recipient pointer not present in payload"),
            }
        }

        distribution
    }
}

fn recipients_from_value(value: &Value) -> Vec<Recipient> {
    let parse = |v: &Value| match serde_json::from_value::<Recipient>(v.clone()) {
        Ok(recipient) => Some(recipient),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed recipient in payload");
            None
        }
    };

    match value {
        Value::Array(items) => items.iter().filter_map(parse).collect(),
        other => parse(other).into_iter().collect(),
    }
}

/// Rule-based resolver. Exact-type rules come before wildcard rules; within
/// each group rules keep their configured order.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipientResolver {
    rules: Vec<RecipientRule>,
}

impl StaticRecipientResolver {
    pub fn new(rules: Vec<RecipientRule>) -> Self {
        Self { rules }
    }

    /// Resolver that returns `distribution` for `event_type`.
    pub fn single(event_type: impl Into<String>, distribution: RecipientDistribution) -> Self {
        Self::new(vec![RecipientRule {
            event_type: event_type.into(),
            name: None,
            payload_pointer: None,
            distribution,
        }])
    }
}

#[async_trait]
impl RecipientResolver for StaticRecipientResolver {
    async fn load(&self, event_type: &str, payload: &Value) -> Result<Vec<RecipientDistribution>> {
        let exact = self
            .rules
            .iter()
            .filter(|r| r.event_type != "*" && r.event_type == event_type);
        let wildcard = self
            .rules
            .iter()
            .filter(|r| r.event_type == "*");

        Ok(exact
            .chain(wildcard)
            .map(|rule| rule.build(payload))
            .filter(|distribution| !distribution.is_empty())
            .collect())
    }
}
