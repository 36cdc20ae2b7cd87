//! Event distribution.
//!
//! # Event Flow
//!
//! 1. `IngestionWorker` publishes a `ChangeEvent` on the `EventBus`
//! 2. `WebhookFanIn`, a durable subscriber, moves each event onto the
//!    webhook queue and confirms it -> `WebhookDispatchWorker`
//! 3. `BroadcastBridge`, a live subscriber, buffers events and flushes
//!    frames to the `ViewerHub` -> live WebSocket viewers

pub mod bus;
pub mod channels;
pub mod types;

pub use bus::{DurableDelivery, DurableReceiver, EventBus, EventReceiver, PublishError};
pub use channels::{DEFAULT_CHANNEL_BUFFER, VIEWER_FRAME_BUFFER, ViewerHub, ViewerReceiver};
pub use types::ChangeEvent;
