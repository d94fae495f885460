//! Build and deploy status notification delivery engine.
//!
//! Queued notifications are drained by priority, throttled per channel and
//! recipient, sent through pluggable channel senders and retried with
//! exponential backoff until delivered or dead-lettered.

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;

use config::Config;
use services::delivery::NotificationDeliveryService;

/// Shared state of the operational HTTP surface.
pub struct AppState {
    pub config: Config,
    pub delivery: Arc<NotificationDeliveryService>,
}
