//! notifyd library crate.
//!
//! Event dispatch to notification channels. Events are delivered to every
//! configured channel with retries, passed through subscribed handlers and
//! processed either immediately or through a job queue.

pub mod config;
pub mod container;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod logging;
pub mod notification;
pub mod queue;
pub mod utils;

pub use container::ServiceContainer;
pub use error::{Error, Result};
pub use execution::{DeploymentMode, EmissionResult, EmitOptions, ExecutionModeManager};
