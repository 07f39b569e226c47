//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel '{channel}' is already bound to provider '{existing}'")]
    DuplicateChannel { channel: String, existing: String },

    #[error("No provider registered for channel '{0}'")]
    ChannelNotFound(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Recipient resolution failed for {event_type}: {message}")]
    RecipientResolution { event_type: String, message: String },

    #[error("Provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },

    #[error("Handler '{handler}' error: {message}")]
    Handler { handler: String, message: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Retry stopped after {attempts} attempts: {source}")]
    RetryAborted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn handler(handler: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: msg.into(),
        }
    }

    /// Whether redelivering the same job could ever succeed.
    ///
    /// Permanent failures are dead-lettered by the queue instead of retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::UnknownEventType(_)
            | Self::Configuration(_)
            | Self::Validation(_)
            | Self::DuplicateChannel { .. }
            | Self::Serialization(_) => true,
            Self::RetryExhausted { source, .. } | Self::RetryAborted { source, .. } => {
                source.is_permanent()
            }
            _ => false,
        }
    }

    /// Number of attempts recorded by the retry engine, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } | Self::RetryAborted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}
