//! Completed result sets keyed by event id.
//!
//! Workers store the outcome of a queued event here; callers that asked to
//! wait are woken through one-shot channels instead of polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::handlers::HandlerResult;
use crate::notification::types::NotificationResult;

/// Everything produced by processing one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOutcome {
    pub results: Vec<NotificationResult>,
    #[serde(default)]
    pub handler_results: Vec<HandlerResult>,
    pub completed_at: DateTime<Utc>,
}

impl EventOutcome {
    pub fn new(results: Vec<NotificationResult>, handler_results: Vec<HandlerResult>) -> Self {
        Self {
            results,
            handler_results,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, Arc<EventOutcome>>,
    waiters: HashMap<String, Vec<oneshot::Sender<Arc<EventOutcome>>>>,
}

/// In-memory result store with completion signalling.
#[derive(Default)]
pub struct ResultStore {
    state: Mutex<StoreState>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the outcome for `event_id` and wake its waiters.
    ///
    /// A redelivered event overwrites the earlier outcome.
    pub fn put(&self, event_id: &str, outcome: EventOutcome) {
        let outcome = Arc::new(outcome);
        let waiters = {
            let mut state = self.state.lock();
            state.entries.insert(event_id.to_string(), outcome.clone());
            state.waiters.remove(event_id).unwrap_or_default()
        };

        debug!(event_id = %event_id, waiters = waiters.len(), "Stored event outcome");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    pub fn get(&self, event_id: &str) -> Option<Arc<EventOutcome>> {
        self.state.lock().entries.get(event_id).cloned()
    }

    /// Wait up to `timeout` for the outcome of `event_id`.
    ///
    /// Returns at once when the outcome is already stored, `None` on timeout.
    pub async fn wait_for(&self, event_id: &str, timeout: Duration) -> Option<Arc<EventOutcome>> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(outcome) = state.entries.get(event_id) {
                return Some(outcome.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(event_id.to_string()).or_default().push(tx);
            rx
        };

        let received = tokio::time::timeout(timeout, rx).await;
        match received {
            Ok(Ok(outcome)) => Some(outcome),
            _ => {
                let mut state = self.state.lock();
                if let Some(waiters) = state.waiters.get_mut(event_id) {
                    waiters.retain(|w| !w.is_closed());
                    if waiters.is_empty() {
                        state.waiters.remove(event_id);
                    }
                }
                state.entries.get(event_id).cloned()
            }
        }
    }

    /// Drop outcomes older than `ttl`. Returns how many were removed.
    pub fn cleanup(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, outcome| outcome.completed_at > cutoff);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callers currently waiting.
    pub fn pending_waiters(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }
}
