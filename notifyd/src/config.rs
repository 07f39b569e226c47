//! Process and dispatch configuration.
//!
//! [`AppConfig`] comes from the environment, [`DispatchConfig`] from a JSON
//! file. Event type settings end up in an immutable [`EventCatalog`] shared
//! with the orchestrator and the execution manager.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::execution::DeploymentMode;
use crate::logging::{LogFormat, LoggingSettings};
use crate::notification::recipients::RecipientRule;
use crate::notification::retry::RetryPolicy;
use crate::{Error, Result};

/// Dispatch config path used when `NOTIFYD_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "notifyd.json";

/// How an event is processed when the caller does not choose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Sync,
    Async,
}

/// Queue priority of an event.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl EventPriority {
    /// Queue weight; higher runs first.
    pub fn weight(self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 10,
        }
    }
}

/// Per event type dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeConfig {
    /// Channel ids, in dispatch order.
    pub channels: Vec<String>,
    #[serde(default)]
    pub default_processing: Option<ProcessingMode>,
    #[serde(default)]
    pub wait_for_result: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Wait-for-result timeout. Falls back to the process default when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_retry_attempts() -> u32 {
    3
}

impl EventTypeConfig {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            default_processing: None,
            wait_for_result: false,
            retry_attempts: default_retry_attempts(),
            priority: EventPriority::Normal,
            delay_ms: None,
            timeout_ms: None,
        }
    }

    pub fn with_processing(mut self, mode: ProcessingMode) -> Self {
        self.default_processing = Some(mode);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_wait_for_result(mut self, timeout_ms: Option<u64>) -> Self {
        self.wait_for_result = true;
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Immutable lookup of event type settings.
#[derive(Debug, Clone, Default)]
pub struct EventCatalog {
    events: HashMap<String, Arc<EventTypeConfig>>,
}

impl EventCatalog {
    /// Build a catalog, normalizing retry attempts and rejecting repeated
    /// channels within one event.
    pub fn new(events: HashMap<String, EventTypeConfig>) -> Result<Self> {
        let mut catalog = HashMap::with_capacity(events.len());

        for (event_type, mut config) in events {
            let mut seen = HashSet::new();
            if let Some(dup) = config.channels.iter().find(|c| !seen.insert(c.as_str())) {
                return Err(Error::config(format!(
                    "event '{event_type}' lists channel '{dup}' more than once"
                )));
            }
            if config.channels.is_empty() {
                warn!(event_type = %event_type, "Event type has no channels configured");
            }
            config.retry_attempts = config.retry_attempts.max(1);
            catalog.insert(event_type, Arc::new(config));
        }

        Ok(Self { events: catalog })
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<EventTypeConfig>> {
        self.events.get(event_type).cloned()
    }

    /// Event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.events.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Reference provider implementations available to the composition root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Log,
    Webhook,
}

/// One channel binding in the dispatch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub channel: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Provider specific settings.
    #[serde(default)]
    pub settings: Value,
}

/// Contents of the dispatch configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub events: HashMap<String, EventTypeConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub recipients: Vec<RecipientRule>,
    #[serde(default)]
    pub audit_handler: bool,
}

impl DispatchConfig {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Consume the event table into a catalog.
    pub fn catalog(&self) -> Result<EventCatalog> {
        EventCatalog::new(self.events.clone())
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: DeploymentMode,
    pub config_path: PathBuf,
    /// Whether `config_path` was set explicitly.
    pub config_path_explicit: bool,
    pub queue_enabled: bool,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub result_ttl: Duration,
    pub dead_letter_retention_days: u32,
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Hybrid,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            config_path_explicit: false,
            queue_enabled: true,
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(100),
            default_timeout: Duration::from_millis(30_000),
            result_ttl: Duration::from_secs(3600),
            dead_letter_retention_days: 7,
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from `NOTIFYD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(mode) = var("NOTIFYD_MODE") {
            config.mode = DeploymentMode::from_str(&mode)
                .map_err(|_| Error::config(format!("Invalid NOTIFYD_MODE: {mode}")))?;
        }

        if let Some(path) = var("NOTIFYD_CONFIG") {
            config.config_path = PathBuf::from(path);
            config.config_path_explicit = true;
        }

        if let Some(enabled) = var("NOTIFYD_QUEUE_ENABLED") {
            config.queue_enabled = parse_bool("NOTIFYD_QUEUE_ENABLED", &enabled)?;
        }

        if let Some(value) = var("NOTIFYD_WORKER_CONCURRENCY") {
            let concurrency: usize = parse_number("NOTIFYD_WORKER_CONCURRENCY", &value)?;
            if concurrency == 0 {
                return Err(Error::config("NOTIFYD_WORKER_CONCURRENCY must be at least 1"));
            }
            config.worker_concurrency = concurrency;
        }

        if let Some(value) = var("NOTIFYD_POLL_INTERVAL_MS") {
            config.poll_interval =
                Duration::from_millis(parse_number("NOTIFYD_POLL_INTERVAL_MS", &value)?);
        }

        if let Some(value) = var("NOTIFYD_DEFAULT_TIMEOUT_MS") {
            config.default_timeout =
                Duration::from_millis(parse_number("NOTIFYD_DEFAULT_TIMEOUT_MS", &value)?);
        }

        if let Some(value) = var("NOTIFYD_RESULT_TTL_SECS") {
            config.result_ttl = Duration::from_secs(parse_number("NOTIFYD_RESULT_TTL_SECS", &value)?);
        }

        if let Some(value) = var("NOTIFYD_DEAD_LETTER_RETENTION_DAYS") {
            config.dead_letter_retention_days =
                parse_number("NOTIFYD_DEAD_LETTER_RETENTION_DAYS", &value)?;
        }

        if let Some(dir) = var("NOTIFYD_LOG_DIR") {
            config.logging.dir = Some(PathBuf::from(dir));
        }

        if let Some(format) = var("NOTIFYD_LOG_FORMAT") {
            config.logging.format = LogFormat::from_str(&format)
                .map_err(|_| Error::config(format!("Invalid NOTIFYD_LOG_FORMAT: {format}")))?;
        }

        if config.mode == DeploymentMode::Worker && !config.queue_enabled {
            return Err(Error::config(
                "NOTIFYD_MODE=worker requires NOTIFYD_QUEUE_ENABLED=true",
            ));
        }

        Ok(config)
    }

    /// Read the dispatch file.
    ///
    /// A missing file at the default path yields an empty configuration; a
    /// missing explicitly configured file is an error.
    pub fn load_dispatch_config(&self) -> Result<DispatchConfig> {
        if !self.config_path_explicit && !self.config_path.exists() {
            warn!(
                path = %self.config_path.display(),
                "Dispatch config not found, starting with an empty event catalog"
            );
            return Ok(DispatchConfig::default());
        }

        DispatchConfig::load(&self.config_path).map_err(|e| match e {
            Error::Io(io) => Error::config(format!(
                "Failed to read {}: {io}",
                self.config_path.display()
            )),
            other => other,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("Invalid {key}: {value}"))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::config(format!("Invalid {key}: {value}")))
}
