//! BroadcastBridge processor.
//!
//! Buffers change events per aircraft and, on every flush tick, pushes one
//! incremental frame to all connected live viewers. Several updates to one
//! aircraft inside a window collapse to its latest record. Push failures
//! are logged and swallowed; viewers resync from the next snapshot.
//!
//! The bridge stops once every publisher dropped the bus, after flushing
//! what is still buffered.

use crate::entities::AircraftLiveRecord;
use crate::events::{ChangeEvent, EventBus, EventReceiver, ViewerHub};
use crate::live_store::LiveStateStore;
use crate::mapper::record_to_entity;
use crate::utils::clock::now_millis;
use compact_str::CompactString;
use skyfuse_sdk::objects::{IncrementalData, LiveServerMessage, SnapshotData};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Latest record per aircraft since the last flush.
#[derive(Debug, Default)]
pub struct BroadcastBuffer {
    pending: HashMap<CompactString, AircraftLiveRecord>,
}

impl BroadcastBuffer {
    pub fn push(&mut self, event: &ChangeEvent) {
        self.pending
            .insert(event.entity_key.clone(), event.record.clone());
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything buffered, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<AircraftLiveRecord> {
        self.pending.drain().map(|(_, record)| record).collect()
    }
}

/// Serialize an incremental frame.
pub fn incremental_frame(records: &[AircraftLiveRecord]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&LiveServerMessage::Incremental {
        timestamp: now_millis(),
        data: IncrementalData {
            updated: records.iter().map(record_to_entity).collect(),
        },
    })
}

/// Serialize the snapshot frame a viewer receives on connect.
pub fn snapshot_frame(live: &LiveStateStore) -> Result<String, serde_json::Error> {
    let records = live.snapshot();
    serde_json::to_string(&LiveServerMessage::Snapshot {
        timestamp: now_millis(),
        data: SnapshotData {
            aircraft: records.iter().map(record_to_entity).collect(),
        },
    })
}

pub struct BroadcastBridge {
    events: EventReceiver,
    hub: ViewerHub,
    flush_interval: Duration,
    buffer: BroadcastBuffer,
}

impl BroadcastBridge {
    pub fn new(bus: &EventBus, hub: ViewerHub, flush_interval: Duration) -> Self {
        Self {
            events: bus.subscribe(),
            hub,
            flush_interval,
            buffer: BroadcastBuffer::default(),
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_ms = self.flush_interval.as_millis() as u64,
            "BroadcastBridge started"
        );
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.flush();
                }

                received = self.events.recv() => match received {
                    Ok(event) => self.buffer.push(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "BroadcastBridge lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed");
                        break;
                    }
                },
            }
        }

        self.flush();
        info!("BroadcastBridge shutdown complete");
    }

    /// Drain the buffer and push one frame to every viewer.
    ///
    /// Returns the number of viewers reached.
    pub fn flush(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        let records = self.buffer.drain();

        if self.hub.viewer_count() == 0 {
            trace!(dropped = records.len(), "No live viewers, buffer dropped");
            return 0;
        }

        let frame = match incremental_frame(&records) {
            Ok(frame) => Arc::<str>::from(frame),
            Err(e) => {
                warn!(error = %e, "Failed to serialize live frame");
                return 0;
            }
        };

        let viewers = self.hub.broadcast(frame);
        debug!(updated = records.len(), viewers, "Live frame pushed");
        viewers
    }
}
