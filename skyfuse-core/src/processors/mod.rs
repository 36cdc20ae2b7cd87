//! Long-running pipeline tasks.
//!
//! The queue workers own a `watch::Receiver<bool>` shutdown flag and exit
//! after their in-flight batch once the flag is set. Event subscribers have
//! no flag; they drain the bus and exit once the ingestion worker, the only
//! publisher, has returned and dropped it.

pub mod batch;
pub mod broadcast_bridge;
pub mod ingestion;
pub mod webhook_dispatch;

pub use batch::{RequeueOutcome, RetryPolicy};
pub use broadcast_bridge::{BroadcastBridge, BroadcastBuffer};
pub use ingestion::{BatchReport, IngestMessage, IngestionWorker};
pub use webhook_dispatch::{
    DeliveryError, DispatchReport, HttpWebhookDelivery, WebhookDelivery, WebhookDispatchWorker,
    WebhookFanIn, WebhookJob, WebhookMessage,
};
