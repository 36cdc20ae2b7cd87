use super::channels::DEFAULT_CHANNEL_BUFFER;
use super::types::ChangeEvent;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::trace;

/// Fan-out of change events to independent subscriber tasks.
///
/// Two kinds of subscriber exist:
/// - Live subscribers share a broadcast channel. A slow one lags and skips
///   events without holding back the publisher or its siblings.
/// - Durable subscribers each own a bounded channel. The publisher waits
///   for room in it and then for the subscriber to confirm the event, so
///   nothing is skipped and a failure reaches the publisher.
///
/// Durable subscribers must be registered before the bus is cloned into a
/// publisher. Subscribers see the bus close once every clone is dropped.
#[derive(Clone)]
pub struct EventBus {
    live: broadcast::Sender<Arc<ChangeEvent>>,
    durable: Vec<mpsc::Sender<DurableDelivery>>,
    capacity: usize,
}

pub type EventReceiver = broadcast::Receiver<Arc<ChangeEvent>>;
pub type DurableReceiver = mpsc::Receiver<DurableDelivery>;

/// One event handed to a durable subscriber, answered once it is stored.
pub struct DurableDelivery {
    pub event: Arc<ChangeEvent>,
    reply: oneshot::Sender<Result<(), String>>,
}

impl DurableDelivery {
    pub fn confirm(self) {
        let _ = self.reply.send(Ok(()));
    }

    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.reply.send(Err(reason.into()));
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("durable event subscriber has stopped")]
    SubscriberGone,

    #[error("durable event subscriber rejected the event: {0}")]
    Rejected(String),
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(capacity);
        Self {
            live,
            durable: Vec::new(),
            capacity,
        }
    }

    /// Publish to every subscriber.
    ///
    /// Returns once every durable subscriber confirmed the event. Live
    /// subscribers are best effort and never fail the call.
    pub async fn publish(&self, event: ChangeEvent) -> Result<(), PublishError> {
        let event = Arc::new(event);
        if self.live.send(event.clone()).is_err() {
            trace!("No live change event subscribers");
        }

        for tx in &self.durable {
            let (reply, confirmed) = oneshot::channel();
            tx.send(DurableDelivery {
                event: event.clone(),
                reply,
            })
            .await
            .map_err(|_| PublishError::SubscriberGone)?;

            match confirmed.await {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => return Err(PublishError::Rejected(reason)),
                Err(_) => return Err(PublishError::SubscriberGone),
            }
        }
        Ok(())
    }

    /// Best-effort subscription.
    pub fn subscribe(&self) -> EventReceiver {
        self.live.subscribe()
    }

    /// Lossless subscription with backpressure.
    pub fn subscribe_durable(&mut self) -> DurableReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.durable.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.receiver_count() + self.durable.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AircraftLiveRecord, ReportProvenance, StateFields};
    use compact_str::CompactString;

    fn event(hex: &str) -> ChangeEvent {
        ChangeEvent::position_updated(
            AircraftLiveRecord {
                hex: CompactString::from(hex),
                state: StateFields::default(),
                provenance: ReportProvenance {
                    source: CompactString::from("adsb"),
                    source_priority: 80,
                    predicted: false,
                    observed_at: 0,
                },
            },
            serde_json::Map::new(),
        )
    }

    #[tokio::test]
    async fn test_every_live_subscriber_gets_every_event() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(event("abc123")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().entity_key, "abc123");
        assert_eq!(b.recv().await.unwrap().entity_key, "abc123");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(8);
        assert!(bus.publish(event("abc123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_durable_publish_waits_for_confirmation() {
        let mut bus = EventBus::new(1);
        let mut durable = bus.subscribe_durable();

        let subscriber = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(delivery) = durable.recv().await {
                seen.push(delivery.event.entity_key.to_string());
                if delivery.event.entity_key == "bad000" {
                    delivery.reject("queue unavailable");
                } else {
                    delivery.confirm();
                }
            }
            seen
        });

        // More events than the channel holds: none is skipped.
        for n in 0..5 {
            bus.publish(event(&format!("aaaa{n:02}"))).await.unwrap();
        }
        let err = bus.publish(event("bad000")).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(reason) if reason == "queue unavailable"));

        drop(bus);
        let seen = subscriber.await.unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[4], "aaaa04");
    }

    #[tokio::test]
    async fn test_stopped_durable_subscriber_fails_publish() {
        let mut bus = EventBus::new(4);
        drop(bus.subscribe_durable());
        let err = bus.publish(event("abc123")).await.unwrap_err();
        assert!(matches!(err, PublishError::SubscriberGone));
    }
}
