//! Handler registry.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{Handler, HandlerMetadata};
use crate::{Error, Result};

/// A handler together with its registration metadata.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn Handler>,
    pub metadata: Arc<HandlerMetadata>,
}

impl RegisteredHandler {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Event type subscriptions of every handler, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `metadata`. Names must be unique.
    pub fn register(&self, handler: Arc<dyn Handler>, metadata: HandlerMetadata) -> Result<()> {
        if metadata.name.trim().is_empty() {
            return Err(Error::config("handler name must not be empty"));
        }
        if metadata.event_types.is_empty() {
            return Err(Error::config(format!(
                "handler '{}' subscribes to no event types",
                metadata.name
            )));
        }

        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.metadata.name == metadata.name) {
            return Err(Error::config(format!(
                "handler '{}' is already registered",
                metadata.name
            )));
        }

        info!(
            handler = %metadata.name,
            event_types = ?metadata.event_types,
            priority = metadata.priority,
            queued = metadata.is_queued(),
            "Registered handler"
        );
        handlers.push(RegisteredHandler {
            handler,
            metadata: Arc::new(metadata),
        });
        Ok(())
    }

    /// Register using the metadata the handler declares.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let metadata = HandlerMetadata::from_handler(handler.as_ref());
        self.register(handler, metadata)
    }

    /// Handlers for `event_type`: exact subscribers followed by wildcard
    /// subscribers, then stably sorted by descending priority.
    pub fn get_handlers(&self, event_type: &str) -> Vec<RegisteredHandler> {
        let handlers = self.handlers.read();
        let exact = handlers
            .iter()
            .filter(|h| h.metadata.subscribes_to(event_type));
        let wildcard = handlers
            .iter()
            .filter(|h| h.metadata.is_wildcard() && !h.metadata.subscribes_to(event_type));

        let mut matched: Vec<RegisteredHandler> = exact.chain(wildcard).cloned().collect();
        matched.sort_by(|a, b| b.metadata.priority.cmp(&a.metadata.priority));
        matched
    }

    pub fn get(&self, name: &str) -> Option<RegisteredHandler> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.metadata.name == name)
            .cloned()
    }

    /// Handlers with a queued processing mode.
    pub fn queued_handlers(&self) -> Vec<RegisteredHandler> {
        self.handlers
            .read()
            .iter()
            .filter(|h| h.metadata.is_queued())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
