//! Application state shared across all request handlers.

use skyfuse_core::config::{ConfigStore, StaticWebhookConfig};
use skyfuse_core::events::ViewerHub;
use skyfuse_core::live_store::LiveStateStore;
use skyfuse_core::processors::WebhookJob;
use skyfuse_core::queue::SharedQueue;
use skyfuse_core::repository::SharedRepository;
use skyfuse_sdk::objects::ReportEnvelope;
use std::sync::Arc;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    pub ingest_queue: SharedQueue<ReportEnvelope>,
    /// Only read here, for depth and dead-letter inspection.
    pub webhook_queue: SharedQueue<WebhookJob>,
    pub repository: SharedRepository,
    pub live: Arc<LiveStateStore>,
    pub hub: ViewerHub,
    /// HMAC key for feeder pushes (can be reloaded via SIGHUP).
    pub feeder_secret: ConfigStore<Box<[u8]>>,
    /// Statically configured webhook endpoints (can be reloaded via SIGHUP).
    pub webhooks: ConfigStore<Vec<StaticWebhookConfig>>,
}
