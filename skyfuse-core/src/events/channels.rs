//! Channel sizing and the live viewer hub.

use std::sync::Arc;
use tokio::sync::broadcast;

/// Default buffer size for event channels.
///
/// Enough to absorb a burst of one ingestion batch while keeping memory
/// bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 1024;

/// Buffer of serialized frames per viewer. A viewer further behind than
/// this skips frames.
pub const VIEWER_FRAME_BUFFER: usize = 64;

/// Sender of serialized live frames to every connected viewer.
///
/// Frames are serialized once and shared; each WebSocket task holds a
/// receiver for as long as its viewer is connected.
#[derive(Clone)]
pub struct ViewerHub {
    tx: broadcast::Sender<Arc<str>>,
}

pub type ViewerReceiver = broadcast::Receiver<Arc<str>>;

impl ViewerHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(VIEWER_FRAME_BUFFER);
        Self { tx }
    }

    /// Send a frame to every viewer. Returns how many viewers it reached.
    pub fn broadcast(&self, frame: Arc<str>) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> ViewerReceiver {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ViewerHub {
    fn default() -> Self {
        Self::new()
    }
}
