//! Shared utilities.

pub mod http_client;
pub mod time;
