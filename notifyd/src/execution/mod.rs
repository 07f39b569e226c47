//! Execution modes: immediate, queued, or decided per event.

pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EventPriority, ProcessingMode};
use crate::handlers::HandlerResult;
use crate::notification::types::NotificationResult;
use crate::queue::QueueStats;

pub use manager::{ExecutionDeps, ExecutionModeManager, ExecutionSettings};

/// Deployment mode of the process.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Every event is processed in-process, immediately.
    Api,
    /// Every event is queued for a worker.
    Worker,
    /// Decided per event.
    #[default]
    Hybrid,
}

/// How one emission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DispatchPath {
    Immediate,
    Queued,
}

/// Per-call emission options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitOptions {
    /// Wins over the event's default processing in hybrid mode.
    #[serde(default)]
    pub mode: Option<ProcessingMode>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Option<EventPriority>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub wait_for_result: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EmitOptions {
    pub fn sync() -> Self {
        Self {
            mode: Some(ProcessingMode::Sync),
            ..Default::default()
        }
    }

    pub fn queued() -> Self {
        Self {
            mode: Some(ProcessingMode::Async),
            ..Default::default()
        }
    }

    pub fn wait(mut self, timeout_ms: Option<u64>) -> Self {
        self.wait_for_result = Some(true);
        self.timeout_ms = timeout_ms;
        self
    }
}

/// What the caller of `emit` gets back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionResult {
    pub event_id: String,
    pub correlation_id: String,
    pub mode: DispatchPath,
    /// Set for immediate dispatch and for queued dispatch that was waited on.
    #[serde(default)]
    pub results: Option<Vec<NotificationResult>>,
    #[serde(default)]
    pub handler_results: Vec<HandlerResult>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: u64,
    /// The wait for a queued result expired.
    #[serde(default)]
    pub timed_out: bool,
}

/// Snapshot of the dispatcher state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStats {
    pub mode: DeploymentMode,
    pub channels: Vec<String>,
    pub event_types: usize,
    pub handlers: usize,
    pub stored_results: usize,
    pub pending_waiters: usize,
    #[serde(default)]
    pub queue: Option<QueueStats>,
}
